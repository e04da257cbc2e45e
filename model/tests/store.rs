use std::{fs, path::PathBuf};

use model::{
    Model, ModelErr, Rules, load_model_file, save_model_file,
    rules::{ComponentSupport, KoRule, RuleSupport, ScoringRule},
    synth::{SynthConfig, random_model},
};

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("model-store-{tag}-{}.safetensors", std::process::id()))
}

fn area_scoring_only() -> RuleSupport {
    RuleSupport {
        scoring_rule: ComponentSupport::only(ScoringRule::Area),
        ko_rule: ComponentSupport::new(
            &[KoRule::Positional, KoRule::Situational],
            KoRule::Positional,
        )
        .with_substitute(KoRule::Spight, KoRule::Situational),
        ..RuleSupport::all()
    }
}

#[test]
fn loaded_models_expose_their_identity() {
    let cfg = SynthConfig {
        name: "b3c8-test".into(),
        version: 11,
        ..SynthConfig::default()
    };
    let path = temp_path("identity");
    save_model_file(&path, &random_model(&cfg, 5)).unwrap();

    let model = load_model_file(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(model.name(), "b3c8-test");
    assert_eq!(model.version(), 11);
    assert_eq!(model.num_input_channels(), cfg.num_input_channels);
    assert_eq!(model.num_input_global_channels(), cfg.num_input_global_channels);
    assert_eq!(model.num_score_value_channels(), cfg.num_score_value_channels);
}

#[test]
fn rule_support_survives_the_artifact() {
    let cfg = SynthConfig {
        rules: area_scoring_only(),
        ..SynthConfig::default()
    };
    let path = temp_path("rules");
    save_model_file(&path, &random_model(&cfg, 2)).unwrap();

    let model = load_model_file(&path).unwrap();
    fs::remove_file(&path).unwrap();

    let supported = Rules::default();
    assert_eq!(model.supported_rules(&supported), (supported, true));

    let desired = Rules {
        scoring_rule: ScoringRule::Territory,
        ko_rule: KoRule::Spight,
        ..Rules::default()
    };
    let (rules, exact) = model.supported_rules(&desired);
    assert!(!exact);
    assert!(model.rule_support().accepts(&rules));
    assert_eq!(rules.scoring_rule, ScoringRule::Area);
    assert_eq!(rules.ko_rule, KoRule::Situational);
    assert_eq!(model.supported_rules(&rules), (rules, true));
}

#[test]
fn truncated_artifacts_fail_to_load() {
    let path = temp_path("truncated");
    save_model_file(&path, &random_model(&SynthConfig::default(), 9)).unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    let err = load_model_file(&path).unwrap_err();
    fs::remove_file(&path).unwrap();

    assert!(matches!(err, ModelErr::Corrupt(_)));
}

#[test]
fn inconsistent_descriptions_are_not_saved() {
    let mut desc = random_model(&SynthConfig::default(), 4);
    desc.num_input_channels += 1;

    let err = save_model_file(temp_path("inconsistent"), &desc).unwrap_err();
    assert!(matches!(err, ModelErr::Inconsistent { .. }));
}

#[test]
fn models_without_spatial_inputs_are_rejected() {
    let mut desc = random_model(&SynthConfig::default(), 5);
    desc.num_input_channels = 0;
    desc.trunk.initial_conv.in_channels = 0;
    desc.trunk.initial_conv.weights.clear();

    let err = Model::new(desc.clone()).unwrap_err();
    assert!(matches!(err, ModelErr::Inconsistent { got: 0, expected: 1, .. }));

    let err = save_model_file(temp_path("no-inputs"), &desc).unwrap_err();
    assert!(matches!(err, ModelErr::Inconsistent { got: 0, expected: 1, .. }));
}
