use std::path::Path;
use std::time::Duration;

use dxgate::config::ServiceConfig;
use dxgate::preprocess::TensorShape;

fn example_config() -> ServiceConfig {
    ServiceConfig::load(&Path::new(env!("CARGO_MANIFEST_DIR")).join("dxgate.example.toml"))
        .unwrap()
}

#[test]
fn shipped_example_config_is_valid() {
    let config = example_config();
    let registry = config.build_registry().unwrap();
    assert_eq!(registry.ids(), vec!["baseline", "chest-probe", "densenet"]);

    let probe = registry.get("chest-probe").unwrap();
    assert!(probe.settings.required);
    assert_eq!(probe.stage.architecture(), "resnet50-linear-probe");
    assert_eq!(probe.settings.input_shape, TensorShape::new(224, 224, 3));

    let densenet = registry.get("densenet").unwrap();
    assert_eq!(densenet.settings.weight, 2.0);
    assert_eq!(densenet.settings.timeout, Duration::from_secs(5));
}

#[test]
fn example_catalog_describes_every_stage() {
    let registry = example_config().build_registry().unwrap();
    let catalog = registry.descriptions();
    assert_eq!(catalog.len(), 3);
    assert!(catalog.iter().all(|s| !s.labels.is_empty()));
}

#[test]
fn missing_config_file_names_the_path() {
    let err = ServiceConfig::load(Path::new("/nonexistent/dxgate.toml")).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/dxgate.toml"));
}
