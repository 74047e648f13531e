use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use caravel_core::config::{FeaturePackConfig, ProvisioningConfig};
use caravel_core::descriptor::{FeaturePackSpec, FEATURE_PACK_DESCRIPTOR};
use caravel_core::location::{FeaturePackLocation, Fpid, UniverseSpec};
use caravel_core::model::{
    ConfigId, ConfigLayerSpec, ConfigModel, FeatureConfig, FeatureGroup, FeatureIdPattern,
    FeatureParamSpec, FeatureReferenceSpec, FeatureSpec, GroupRef, PackageSpec,
};
use caravel_provision::runtime::{Provisioner, METADATA_DIR, PROVISIONING_FILE};
use caravel_universe::backend::{ArtifactBackend, Coordinate, FsBackend};
use caravel_universe::universe::UNIVERSE_DESCRIPTOR;
use caravel_util::errors::{as_caravel_error, CaravelError};

const GROUP: &str = "org.test";

struct Store {
    dir: tempfile::TempDir,
}

impl Store {
    fn new(producers: &[&str]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let store = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        let backend = store.backend();
        let mut body = String::new();
        for producer in producers {
            body.push_str(&format!(
                r#"
[[producers]]
name = "{producer}"
coordinate = "{GROUP}:{producer}"
default-channel = "current"

[[producers.channels]]
name = "current"
version-range = "(,)"
"#
            ));
        }
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(UNIVERSE_DESCRIPTOR), body).unwrap();
        let mut coord = Coordinate::from_ga(&format!("{GROUP}:universe"), "1.0.0").unwrap();
        coord.extension = "toml".to_string();
        backend.deploy(&coord, src.path()).unwrap();
        store
    }

    fn backend(&self) -> FsBackend {
        FsBackend::new(self.dir.path())
    }

    /// Deploy a feature pack; `files` are paths relative to the pack root,
    /// e.g. `packages/bin/content/tool.sh`.
    fn deploy(&self, spec: &FeaturePackSpec, files: &[(&str, &str)]) {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(
            src.path().join(FEATURE_PACK_DESCRIPTOR),
            spec.to_string_pretty().unwrap(),
        )
        .unwrap();
        for (rel, body) in files {
            let path = src.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        let coord = Coordinate::from_ga(
            &format!("{GROUP}:{}", spec.fpid().producer),
            &spec.fpid().build,
        )
        .unwrap();
        self.backend().deploy(&coord, src.path()).unwrap();
    }

    fn provisioner(&self) -> Provisioner {
        let backend: Arc<dyn ArtifactBackend> = Arc::new(self.backend());
        Provisioner::new(backend)
    }
}

fn provisioning(packs: Vec<FeaturePackConfig>) -> ProvisioningConfig {
    let mut builder = ProvisioningConfig::builder()
        .default_universe(UniverseSpec::parse(&format!("registry({GROUP}:universe)")).unwrap());
    for pack in packs {
        builder = builder.add_feature_pack(pack);
    }
    builder.build()
}

fn plain(location: &str) -> FeaturePackConfig {
    FeaturePackConfig::new(FeaturePackLocation::parse(location).unwrap())
}

fn pack(producer: &str, build: &str) -> FeaturePackSpec {
    FeaturePackSpec::new(Fpid::parse(&format!("{producer}#{build}")).unwrap())
}

fn id_param(name: &str) -> FeatureParamSpec {
    FeatureParamSpec {
        name: name.to_string(),
        id: true,
        ..Default::default()
    }
}

fn param(name: &str, default: Option<&str>) -> FeatureParamSpec {
    FeatureParamSpec {
        name: name.to_string(),
        default: default.map(str::to_string),
        ..Default::default()
    }
}

fn socket_spec() -> FeatureSpec {
    FeatureSpec::builder("socket")
        .add_param(id_param("name"))
        .add_param(param("port", Some("8080")))
        .build()
}

fn install_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server");
    (dir, path)
}

#[test]
fn include_only_named_config_when_inheritance_is_off() {
    // Scenario: a pack declaring several default configs, provisioned with
    // inherit-configs = false and one explicit include.
    let store = Store::new(&["packb"]);
    let mut spec = pack("packb", "1.0.0");
    spec.feature_specs.push(socket_spec());
    spec.configs.push(
        ConfigModel::builder("model1", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .build(),
    );
    spec.configs.push(ConfigModel::builder("model1", "other").build());
    spec.configs.push(ConfigModel::builder("model2", "main").build());
    store.deploy(&spec, &[]);

    let config = provisioning(vec![FeaturePackConfig::builder(
        FeaturePackLocation::parse("packb#1.0.0").unwrap(),
    )
    .inherit_configs(false)
    .include_default_config("model1", "main")
    .build()]);

    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    let ids: Vec<String> = state.configs.iter().map(|c| c.id.to_string()).collect();
    assert_eq!(ids, vec!["model1:main"]);
}

#[test]
fn excluding_a_whole_model_keeps_the_other_models() {
    let store = Store::new(&["packc"]);
    let mut spec = pack("packc", "1.0.0");
    spec.configs.push(ConfigModel::builder("model1", "main").build());
    spec.configs.push(ConfigModel::builder("model1", "other").build());
    spec.configs.push(ConfigModel::builder("model2", "main").build());
    spec.configs.push(ConfigModel::builder("model2", "other").build());
    store.deploy(&spec, &[]);

    let config = provisioning(vec![FeaturePackConfig::builder(
        FeaturePackLocation::parse("packc#1.0.0").unwrap(),
    )
    .exclude_config_model("model2")
    .build()]);

    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    let ids: Vec<String> = state.configs.iter().map(|c| c.id.to_string()).collect();
    assert_eq!(ids, vec!["model1:main", "model1:other"]);
}

#[test]
fn configs_with_one_id_merge_across_feature_packs() {
    // Scenario: base and dependent packs contribute the same config id; the
    // dependent re-declares one property and one feature with an
    // overlapping id.
    let store = Store::new(&["base", "child"]);

    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .prop("launch", "base")
            .prop("keep", "base-only")
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("port", "8080"),
            )
            .build(),
    );
    store.deploy(&base, &[]);

    let mut child = pack("child", "1.0.0");
    child
        .dependencies
        .push(plain("base#1.0.0"));
    child.configs.push(
        ConfigModel::builder("standalone", "main")
            .prop("launch", "child")
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("port", "9090"),
            )
            .build(),
    );
    store.deploy(&child, &[]);

    let config = provisioning(vec![plain("base#1.0.0"), plain("child#1.0.0")]);
    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    assert_eq!(state.configs.len(), 1);
    let merged = state.config("standalone", "main").unwrap();
    // The dependent's property value wins; untouched properties survive.
    assert_eq!(merged.props["launch"], "child");
    assert_eq!(merged.props["keep"], "base-only");
    // One feature, with the dependent's non-id parameter.
    assert_eq!(merged.features.len(), 1);
    assert_eq!(merged.features[0].id.param("name"), Some("http"));
    assert_eq!(merged.features[0].params["port"], "9090");
}

#[test]
fn provisioning_twice_is_deterministic() {
    let store = Store::new(&["base", "child"]);

    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .add_feature(FeatureConfig::new("socket").param("name", "https"))
            .build(),
    );
    store.deploy(&base, &[]);

    let mut child = pack("child", "1.0.0");
    child.dependencies.push(plain("base#1.0.0"));
    child.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "admin"))
            .build(),
    );
    store.deploy(&child, &[]);

    let config = provisioning(vec![plain("base#1.0.0"), plain("child#1.0.0")]);

    let (_g1, first_dir) = install_dir();
    let first = store.provisioner().provision(&first_dir, &config).unwrap();
    let (_g2, second_dir) = install_dir();
    let second = store.provisioner().provision(&second_dir, &config).unwrap();

    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    // Features ordered by (declaring pack order, declaration order).
    let names: Vec<&str> = first.configs[0]
        .features
        .iter()
        .map(|f| f.id.param("name").unwrap())
        .collect();
    assert_eq!(names, vec!["http", "https", "admin"]);

    // No two features share a resolved id.
    let mut seen = std::collections::HashSet::new();
    for feature in &first.configs[0].features {
        assert!(seen.insert(&feature.id));
    }
}

#[test]
fn persisted_descriptor_round_trips() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.configs.push(ConfigModel::builder("standalone", "main").build());
    store.deploy(&base, &[]);

    let config = provisioning(vec![FeaturePackConfig::builder(
        FeaturePackLocation::parse("base#1.0.0").unwrap(),
    )
    .inherit_configs(true)
    .exclude_package("docs")
    .build()]);
    // The exclusion names an unknown package: expect failure and an
    // untouched installation.
    let (_guard, target) = install_dir();
    assert!(store.provisioner().provision(&target, &config).is_err());
    assert!(!target.join(METADATA_DIR).join(PROVISIONING_FILE).exists());

    let config = provisioning(vec![plain("base#1.0.0")]);
    let state = store.provisioner().provision(&target, &config).unwrap();
    assert_eq!(state.configs.len(), 1);

    let persisted = store.provisioner().installed_config(&target).unwrap();
    assert_eq!(persisted, config);

    let reloaded = store.provisioner().installed_state(&target).unwrap();
    assert_eq!(reloaded, state);
}

#[test]
fn dependency_declarations_propagate_nothing_unless_asked() {
    let store = Store::new(&["base", "child"]);

    let mut base = pack("base", "1.0.0");
    base.configs.push(ConfigModel::builder("standalone", "main").build());
    store.deploy(&base, &[]);

    let mut child = pack("child", "1.0.0");
    child.dependencies.push(plain("base#1.0.0"));
    store.deploy(&child, &[]);

    // base is only a dependency: its default configs stay out.
    let config = provisioning(vec![plain("child#1.0.0")]);
    let (_g1, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    assert!(state.configs.is_empty());

    // The declaring pack can opt its dependency's configs in.
    let mut child = pack("child", "1.1.0");
    child.dependencies.push(
        FeaturePackConfig::builder(FeaturePackLocation::parse("base#1.0.0").unwrap())
            .inherit_configs(true)
            .build(),
    );
    store.deploy(&child, &[]);

    let config = provisioning(vec![plain("child#1.1.0")]);
    let (_g2, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    assert!(state.config("standalone", "main").is_some());
}

#[test]
fn missing_reference_target_is_fatal() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(
        FeatureSpec::builder("interface")
            .add_param(id_param("name"))
            .build(),
    );
    base.feature_specs.push(
        FeatureSpec::builder("socket")
            .add_param(id_param("name"))
            .add_param(param("interface", None))
            .add_ref(FeatureReferenceSpec {
                feature: "interface".to_string(),
                nillable: false,
                mappings: BTreeMap::from([("interface".to_string(), "name".to_string())]),
            })
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("interface", "public"),
            )
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_g1, target) = install_dir();
    let err = store.provisioner().provision(&target, &config).unwrap_err();
    assert!(matches!(
        as_caravel_error(&err),
        Some(CaravelError::DanglingReference { .. })
    ));

    // Adding the target interface satisfies the reference.
    let mut fixed = pack("base", "1.0.1");
    fixed.feature_specs = base.feature_specs.clone();
    fixed.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("interface").param("name", "public"))
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("interface", "public"),
            )
            .build(),
    );
    store.deploy(&fixed, &[]);

    let config = provisioning(vec![plain("base#1.0.1")]);
    let (_g2, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    assert_eq!(state.configs[0].features.len(), 2);
}

#[test]
fn nillable_reference_may_stay_unset() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(
        FeatureSpec::builder("interface")
            .add_param(id_param("name"))
            .build(),
    );
    base.feature_specs.push(
        FeatureSpec::builder("socket")
            .add_param(id_param("name"))
            .add_param(param("interface", None))
            .add_ref(FeatureReferenceSpec {
                feature: "interface".to_string(),
                nillable: true,
                mappings: BTreeMap::from([("interface".to_string(), "name".to_string())]),
            })
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("interface", "missing"),
            )
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    assert!(store.provisioner().provision(&target, &config).is_ok());
}

#[test]
fn reference_supplies_missing_id_param_from_most_recent_target() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(
        FeatureSpec::builder("interface")
            .add_param(id_param("name"))
            .build(),
    );
    base.feature_specs.push(
        FeatureSpec::builder("binding")
            .add_param(id_param("interface"))
            .add_ref(FeatureReferenceSpec {
                feature: "interface".to_string(),
                nillable: false,
                mappings: BTreeMap::from([("interface".to_string(), "name".to_string())]),
            })
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("interface").param("name", "public"))
            .add_feature(FeatureConfig::new("interface").param("name", "private"))
            .add_feature(FeatureConfig::new("binding"))
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    let binding = state.configs[0]
        .features
        .iter()
        .find(|f| f.id.spec.name == "binding")
        .unwrap();
    assert_eq!(binding.id.param("interface"), Some("private"));
}

#[test]
fn excluded_features_are_removed_after_merge() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .add_feature(FeatureConfig::new("socket").param("name", "https"))
            .build(),
    );
    store.deploy(&base, &[]);

    // The provisioning config's inline fragment excludes one feature id.
    let config = ProvisioningConfig::builder()
        .default_universe(UniverseSpec::parse(&format!("registry({GROUP}:universe)")).unwrap())
        .add_feature_pack(plain("base#1.0.0"))
        .add_config(
            ConfigModel::builder("standalone", "main")
                .exclude_feature(FeatureIdPattern {
                    spec: "socket".to_string(),
                    origin: None,
                    params: BTreeMap::from([("name".to_string(), "http".to_string())]),
                })
                .build(),
        )
        .build();

    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    let names: Vec<&str> = state.configs[0]
        .features
        .iter()
        .map(|f| f.id.param("name").unwrap())
        .collect();
    assert_eq!(names, vec!["https"]);
}

#[test]
fn wildcard_exclusion_matches_every_id_value() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.feature_specs.push(
        FeatureSpec::builder("logger")
            .add_param(id_param("category"))
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .add_feature(FeatureConfig::new("socket").param("name", "https"))
            .add_feature(FeatureConfig::new("logger").param("category", "root"))
            .build(),
    );
    store.deploy(&base, &[]);

    let config = ProvisioningConfig::builder()
        .default_universe(UniverseSpec::parse(&format!("registry({GROUP}:universe)")).unwrap())
        .add_feature_pack(plain("base#1.0.0"))
        .add_config(
            ConfigModel::builder("standalone", "main")
                .exclude_feature(FeatureIdPattern {
                    spec: "socket".to_string(),
                    origin: None,
                    params: BTreeMap::new(),
                })
                .build(),
        )
        .build();

    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    let names: Vec<&str> = state.configs[0]
        .features
        .iter()
        .map(|f| f.id.spec.name.as_str())
        .collect();
    assert_eq!(names, vec!["logger"]);
}

#[test]
fn re_adding_an_excluded_feature_wins_by_processing_order() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .build(),
    );
    store.deploy(&base, &[]);

    // First inline fragment excludes; a later fragment re-adds the same id.
    let config = ProvisioningConfig::builder()
        .default_universe(UniverseSpec::parse(&format!("registry({GROUP}:universe)")).unwrap())
        .add_feature_pack(plain("base#1.0.0"))
        .add_config(
            ConfigModel::builder("standalone", "main")
                .exclude_feature(FeatureIdPattern {
                    spec: "socket".to_string(),
                    origin: None,
                    params: BTreeMap::from([("name".to_string(), "http".to_string())]),
                })
                .build(),
        )
        .add_config(
            ConfigModel::builder("standalone", "main")
                .add_feature(FeatureConfig::new("socket").param("name", "http"))
                .build(),
        )
        .build();

    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    assert_eq!(state.configs[0].features.len(), 1);
}

#[test]
fn exclusion_that_breaks_a_reference_is_fatal() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(
        FeatureSpec::builder("interface")
            .add_param(id_param("name"))
            .build(),
    );
    base.feature_specs.push(
        FeatureSpec::builder("socket")
            .add_param(id_param("name"))
            .add_param(param("interface", None))
            .add_ref(FeatureReferenceSpec {
                feature: "interface".to_string(),
                nillable: false,
                mappings: BTreeMap::from([("interface".to_string(), "name".to_string())]),
            })
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("interface").param("name", "public"))
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("interface", "public"),
            )
            .build(),
    );
    store.deploy(&base, &[]);

    let config = ProvisioningConfig::builder()
        .default_universe(UniverseSpec::parse(&format!("registry({GROUP}:universe)")).unwrap())
        .add_feature_pack(plain("base#1.0.0"))
        .add_config(
            ConfigModel::builder("standalone", "main")
                .exclude_feature(FeatureIdPattern {
                    spec: "interface".to_string(),
                    origin: None,
                    params: BTreeMap::new(),
                })
                .build(),
        )
        .build();

    let (_guard, target) = install_dir();
    let err = store.provisioner().provision(&target, &config).unwrap_err();
    assert!(matches!(
        as_caravel_error(&err),
        Some(CaravelError::DanglingReference { .. })
    ));
}

#[test]
fn feature_groups_expand_depth_first() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.packages.declared.push(PackageSpec {
        name: "web-lib".to_string(),
        ..Default::default()
    });
    base.feature_groups.push(
        FeatureGroup::builder("admin-sockets")
            .add_feature(FeatureConfig::new("socket").param("name", "admin"))
            .build(),
    );
    base.feature_groups.push(
        FeatureGroup::builder("web-sockets")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .add_feature(FeatureConfig::new("socket").param("name", "https"))
            .add_group(GroupRef {
                name: "admin-sockets".to_string(),
                origin: None,
                params: BTreeMap::new(),
            })
            .add_package("web-lib")
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_group(GroupRef {
                name: "web-sockets".to_string(),
                origin: None,
                params: BTreeMap::from([("port".to_string(), "9000".to_string())]),
            })
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    let names: Vec<&str> = state.configs[0]
        .features
        .iter()
        .map(|f| f.id.param("name").unwrap())
        .collect();
    // Listed features first, nested group expansions after.
    assert_eq!(names, vec!["http", "https", "admin"]);
    // Caller parameter overrides reached every expanded feature.
    for feature in &state.configs[0].features {
        assert_eq!(feature.params["port"], "9000");
    }
    // The group's package dependency was carried forward.
    let base_state = state.feature_pack(&format!("base@registry({GROUP}:universe)")).unwrap();
    assert!(base_state.packages.contains(&"web-lib".to_string()));
}

#[test]
fn self_referencing_group_is_rejected() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_groups.push(
        FeatureGroup::builder("g1")
            .add_group(GroupRef {
                name: "g2".to_string(),
                origin: None,
                params: BTreeMap::new(),
            })
            .build(),
    );
    base.feature_groups.push(
        FeatureGroup::builder("g2")
            .add_group(GroupRef {
                name: "g1".to_string(),
                origin: None,
                params: BTreeMap::new(),
            })
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_group(GroupRef {
                name: "g1".to_string(),
                origin: None,
                params: BTreeMap::new(),
            })
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let err = store.provisioner().provision(&target, &config).unwrap_err();
    assert!(matches!(
        as_caravel_error(&err),
        Some(CaravelError::CycleDetected { .. })
    ));
}

#[test]
fn layers_resolve_across_the_whole_graph() {
    let store = Store::new(&["base", "child"]);

    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.layers.push(ConfigLayerSpec {
        model: "standalone".to_string(),
        name: "web".to_string(),
        features: vec![FeatureConfig::new("socket").param("name", "http")],
        groups: Vec::new(),
        packages: Vec::new(),
    });
    store.deploy(&base, &[]);

    let mut child = pack("child", "1.0.0");
    child.dependencies.push(plain("base#1.0.0"));
    child.configs.push(
        ConfigModel::builder("standalone", "main")
            .include_layer("web")
            .add_feature(FeatureConfig::new("socket").param("name", "admin"))
            .build(),
    );
    store.deploy(&child, &[]);

    let config = provisioning(vec![plain("child#1.0.0")]);
    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    let names: Vec<&str> = state.configs[0]
        .features
        .iter()
        .map(|f| f.id.param("name").unwrap())
        .collect();
    // Layer features come before the config's own features.
    assert_eq!(names, vec!["http", "admin"]);
}

#[test]
fn unknown_layer_is_fatal() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .include_layer("nowhere")
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let err = store.provisioner().provision(&target, &config).unwrap_err();
    assert!(matches!(
        as_caravel_error(&err),
        Some(CaravelError::UnknownSelectionTarget { kind: "layer", .. })
    ));
}

#[test]
fn excluded_layers_do_not_expand() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(socket_spec());
    base.layers.push(ConfigLayerSpec {
        model: "standalone".to_string(),
        name: "web".to_string(),
        features: vec![FeatureConfig::new("socket").param("name", "http")],
        groups: Vec::new(),
        packages: Vec::new(),
    });
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .include_layer("web")
            .exclude_layer("web")
            .build(),
    );
    store.deploy(&base, &[]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();
    assert!(state.configs[0].features.is_empty());
}

#[test]
fn conflicting_fixed_parameter_is_fatal() {
    let store = Store::new(&["base", "child"]);

    let mut base = pack("base", "1.0.0");
    base.feature_specs.push(
        FeatureSpec::builder("socket")
            .add_param(id_param("name"))
            .add_param(FeatureParamSpec {
                name: "protocol".to_string(),
                fixed: true,
                ..Default::default()
            })
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("protocol", "tcp"),
            )
            .build(),
    );
    store.deploy(&base, &[]);

    let mut child = pack("child", "1.0.0");
    child.dependencies.push(plain("base#1.0.0"));
    child.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(
                FeatureConfig::new("socket")
                    .param("name", "http")
                    .param("protocol", "udp"),
            )
            .build(),
    );
    store.deploy(&child, &[]);

    let config = provisioning(vec![plain("base#1.0.0"), plain("child#1.0.0")]);
    let (_guard, target) = install_dir();
    let err = store.provisioner().provision(&target, &config).unwrap_err();
    assert!(matches!(
        as_caravel_error(&err),
        Some(CaravelError::ConflictingFeatureParam { .. })
    ));
}

#[test]
fn packages_and_patches_assemble_into_the_installation() {
    let store = Store::new(&["base", "base-fix"]);

    let mut base = pack("base", "1.0.0");
    base.packages.default = vec!["bin".to_string()];
    base.packages.declared = vec![
        PackageSpec {
            name: "bin".to_string(),
            deps: vec!["modules".to_string()],
            ..Default::default()
        },
        PackageSpec {
            name: "modules".to_string(),
            ..Default::default()
        },
    ];
    store.deploy(
        &base,
        &[
            ("packages/bin/content/bin/tool.sh", "v1"),
            ("packages/modules/content/modules/readme.txt", "modules"),
        ],
    );

    let mut patch = pack("base-fix", "1.0.1");
    patch.pack.patch_for = Some(Fpid::parse("base#1.0.0").unwrap());
    store.deploy(&patch, &[("packages/bin/content/bin/tool.sh", "v2")]);

    let config = provisioning(vec![FeaturePackConfig::builder(
        FeaturePackLocation::parse("base#1.0.0").unwrap(),
    )
    .add_patch(Fpid::parse("base-fix#1.0.1").unwrap())
    .build()]);

    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    // Default package plus its declared dependency were selected.
    let packs = &state.feature_packs;
    assert_eq!(packs.len(), 1);
    assert_eq!(packs[0].packages, vec!["bin", "modules"]);

    // Patch content overlays the base content.
    assert_eq!(
        std::fs::read_to_string(target.join("bin/tool.sh")).unwrap(),
        "v2"
    );
    assert_eq!(
        std::fs::read_to_string(target.join("modules/readme.txt")).unwrap(),
        "modules"
    );
}

#[test]
fn feature_spec_packages_join_the_provisioned_set() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.packages.declared = vec![PackageSpec {
        name: "socket-lib".to_string(),
        ..Default::default()
    }];
    base.feature_specs.push(
        FeatureSpec::builder("socket")
            .add_param(id_param("name"))
            .add_package("socket-lib")
            .build(),
    );
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .build(),
    );
    store.deploy(&base, &[("packages/socket-lib/content/lib/socket.txt", "lib")]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let state = store.provisioner().provision(&target, &config).unwrap();

    assert!(state.feature_packs[0]
        .packages
        .contains(&"socket-lib".to_string()));
    assert!(target.join("lib/socket.txt").is_file());
}

#[test]
fn unknown_package_selection_is_fatal() {
    let store = Store::new(&["base"]);
    let base = pack("base", "1.0.0");
    store.deploy(&base, &[]);

    let config = provisioning(vec![FeaturePackConfig::builder(
        FeaturePackLocation::parse("base#1.0.0").unwrap(),
    )
    .include_package("missing")
    .build()]);

    let (_guard, target) = install_dir();
    let err = store.provisioner().provision(&target, &config).unwrap_err();
    assert!(matches!(
        as_caravel_error(&err),
        Some(CaravelError::UnknownSelectionTarget { kind: "package", .. })
    ));
}

#[test]
fn failed_operation_leaves_previous_installation_intact() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.packages.default = vec!["bin".to_string()];
    store.deploy(&base, &[("packages/bin/content/bin/tool.sh", "v1")]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    store.provisioner().provision(&target, &config).unwrap();
    assert_eq!(
        std::fs::read_to_string(target.join("bin/tool.sh")).unwrap(),
        "v1"
    );

    // A second operation that fails in resolution must not disturb the
    // installed tree or its metadata.
    let bad = provisioning(vec![plain("base#9.9.9")]);
    assert!(store.provisioner().provision(&target, &bad).is_err());
    assert_eq!(
        std::fs::read_to_string(target.join("bin/tool.sh")).unwrap(),
        "v1"
    );
    let persisted = store.provisioner().installed_config(&target).unwrap();
    assert_eq!(persisted, config);
}

#[test]
fn reprovisioning_from_the_persisted_descriptor_is_stable() {
    let store = Store::new(&["base"]);
    let mut base = pack("base", "1.0.0");
    base.packages.default = vec!["bin".to_string()];
    base.feature_specs.push(socket_spec());
    base.configs.push(
        ConfigModel::builder("standalone", "main")
            .prop("launch", "server")
            .add_feature(FeatureConfig::new("socket").param("name", "http"))
            .build(),
    );
    store.deploy(&base, &[("packages/bin/content/bin/tool.sh", "v1")]);

    let config = provisioning(vec![plain("base#1.0.0")]);
    let (_guard, target) = install_dir();
    let first = store.provisioner().provision(&target, &config).unwrap();

    let second = store.provisioner().reprovision(&target).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        std::fs::read_to_string(target.join("bin/tool.sh")).unwrap(),
        "v1"
    );
}

fn _assert_send_sync<T: Send + Sync>(_: &T) {}

#[test]
fn provisioner_is_shareable_across_threads() {
    let store = Store::new(&[]);
    let provisioner = store.provisioner();
    _assert_send_sync(&provisioner);
}
