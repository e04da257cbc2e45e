use backend::{BackendErr, ContextConfig, Runtime};
use model::{
    Model,
    synth::{SynthConfig, random_model},
};

// Kept alone in its binary, any other test would hold the runtime.
#[test]
fn only_one_runtime_at_a_time() {
    assert!(!Runtime::is_initialized());
    let runtime = Runtime::initialize().unwrap();
    assert!(Runtime::is_initialized());

    assert!(matches!(Runtime::initialize(), Err(BackendErr::AlreadyInitialized)));

    let model = Model::new(random_model(&SynthConfig::default(), 0)).unwrap();
    let cfg = ContextConfig {
        width: 5,
        height: 5,
        ..ContextConfig::default()
    };
    let ctx = runtime.create_context(&cfg, &model).unwrap();
    assert_eq!(ctx.devices(), vec![0]);
    drop(ctx);

    drop(runtime);
    assert!(!Runtime::is_initialized());
    Runtime::initialize().unwrap();
}
