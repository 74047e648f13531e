use miette::Diagnostic;
use thiserror::Error;

/// Unified error type for all Caravel operations.
///
/// Every error carries enough identity (feature pack id, config id, feature
/// id) to pinpoint the offending declaration. Nothing is logged-and-swallowed
/// inside the engine; any error aborts the whole operation.
#[derive(Debug, Error, Diagnostic)]
pub enum CaravelError {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A feature pack address string violated the grammar.
    #[error("malformed feature pack location `{text}`: {reason}")]
    #[diagnostic(help(
        "expected producer[@factory[(location)]][:channel][/frequency][#build]"
    ))]
    MalformedLocation { text: String, reason: String },

    /// A version range expression could not be parsed.
    #[error("malformed version range `{text}`: {reason}")]
    MalformedRange { text: String, reason: String },

    /// A descriptor file was missing or failed to parse.
    #[error("descriptor error in {path}: {message}")]
    Descriptor { path: String, message: String },

    /// No factory is registered for the requested universe spec.
    #[error("unknown universe `{spec}`")]
    UnknownUniverse { spec: String },

    /// The universe does not list the requested producer.
    #[error("producer `{producer}` not found in universe `{universe}`")]
    ProducerNotFound { universe: String, producer: String },

    /// The producer does not declare the requested channel.
    #[error("channel `{channel}` not found for producer `{producer}`")]
    ChannelNotFound { producer: String, channel: String },

    /// No build of the producer satisfies the channel's range.
    ///
    /// `below_floor` distinguishes "the range is empty" from "only versions
    /// below the requested qualifier floor exist".
    #[error("no version of `{producer}` matches `{range}` at qualifier floor `{floor}`")]
    #[diagnostic(help("a lower frequency on the channel may admit pre-release builds"))]
    NoMatchingVersion {
        producer: String,
        range: String,
        floor: String,
        below_floor: bool,
    },

    /// Dependency or feature-group expansion revisited a node on the current path.
    #[error("cycle detected at `{at}`")]
    CycleDetected { at: String },

    /// Two independently declared explicit builds for the same producer.
    #[error(
        "feature packs `{first}` and `{second}` declare conflicting explicit builds for producer `{producer}`"
    )]
    ConflictingExplicitVersions {
        producer: String,
        first: String,
        second: String,
    },

    /// A transitive customization names a producer that never entered the layout.
    #[error("producer `{producer}` was declared transitive but no feature pack in the layout depends on it")]
    MissingRequiredProducer { producer: String },

    /// A patch targets a feature pack that is not part of the layout.
    #[error("patch `{patch}` targets `{target}` which is not in the layout")]
    PatchTargetNotInLayout { patch: String, target: String },

    /// A feature pack requires a newer engine than the one running.
    #[error("feature pack `{fpid}` requires engine version {required}, running engine is {actual}")]
    MinimumEngineVersionUnsatisfied {
        fpid: String,
        required: String,
        actual: String,
    },

    /// An include/exclude named a package, config, or layer that does not exist.
    #[error("unknown {kind} `{name}` selected in `{fpid}`")]
    UnknownSelectionTarget {
        kind: &'static str,
        name: String,
        fpid: String,
    },

    /// A non-nillable feature reference has no resolvable target.
    #[error("unresolved reference from feature `{from}` to spec `{to}` in config `{config}`")]
    DanglingReference {
        from: String,
        to: String,
        config: String,
    },

    /// Two occurrences of one feature disagree on a non-overridable parameter.
    #[error(
        "conflicting values for non-overridable parameter `{param}` of feature `{feature}`: `{first}` vs `{second}`"
    )]
    ConflictingFeatureParam {
        feature: String,
        param: String,
        first: String,
        second: String,
    },

    /// Invalid provisioning configuration (bad option combinations etc.).
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Catch-all for miscellaneous errors.
    #[error("{message}")]
    Generic { message: String },
}

/// Convenience alias for `miette::Result<T>`.
pub type CaravelResult<T> = miette::Result<T>;

/// Downcast a `miette::Report` back to the engine error, if it is one.
pub fn as_caravel_error(report: &miette::Report) -> Option<&CaravelError> {
    report.downcast_ref::<CaravelError>()
}
