//! Public contract of an explicitly constructed binding.

use std::time::{Duration, SystemTime};

use tokio_test::{assert_err, assert_ok};
use wasm_calc::{
    Binding, BindingError, CallContext, CompiledModule, RuntimeConfig, RuntimeError, WasmEngine,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn binding(pool_size: usize) -> Binding {
    init_tracing();

    let mut config = RuntimeConfig::default();
    config.pool.pool_size = pool_size;
    Binding::new(&config).await.unwrap()
}

#[tokio::test]
async fn test_parse_returns_raw_and_result() -> anyhow::Result<()> {
    let binding = binding(1).await;
    let ctx = CallContext::background();

    let expr = binding.parse(&ctx, "1+2").await?;
    assert_eq!(expr.raw(), "1+2");
    assert_eq!(expr.result(), "3");

    let cases = [
        ("2+3*4", "14"),
        ("(2+3)*4", "20"),
        (" 10 / 3 ", "3"),
        ("-7/2", "-3"),
        ("-(1+2)*-3", "9"),
        ("9223372036854775807", "9223372036854775807"),
    ];
    for (input, expected) in cases {
        let expr = binding.parse(&ctx, input).await?;
        assert_eq!(expr.raw(), input);
        assert_eq!(expr.result(), expected, "input {input:?}");
    }

    Ok(())
}

#[tokio::test]
async fn test_parse_error_has_no_result() {
    let binding = binding(1).await;
    let ctx = CallContext::background();

    for input in ["1+", "", "1 +* 2", "(1+2", "1/0", "abc"] {
        let err = assert_err!(binding.parse(&ctx, input).await);
        assert!(err.is_parse(), "input {input:?} gave {err}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parse_concurrent() {
    let binding = binding(4).await;
    let ctx = CallContext::background();

    let (results, error) = binding.parse_concurrent(&ctx, &["1+2", "3+4", "5+6"]).await;
    assert!(error.is_none());
    let values: Vec<_> = results
        .iter()
        .map(|slot| slot.as_ref().map(|expr| expr.result()))
        .collect();
    assert_eq!(values, vec![Some("3"), Some("7"), Some("11")]);

    let (results, error) = binding
        .parse_concurrent(&ctx, &["1+2", "invalid", "5+6"])
        .await;
    assert!(error.is_some_and(|e| e.is_parse()));
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().map(|e| e.result()), Some("3"));
    assert!(results[1].is_none());
    assert_eq!(results[2].as_ref().map(|e| e.raw()), Some("5+6"));
    assert_eq!(results[2].as_ref().map(|e| e.result()), Some("11"));
}

#[tokio::test]
async fn test_parse_batch_keeps_every_error() {
    let binding = binding(2).await;

    let outcome = binding
        .parse_batch(&CallContext::background(), &["1+", "2", "(3"])
        .await;

    assert_eq!(outcome.len(), 3);
    assert_eq!(outcome.failed(), 2);
    let failed: Vec<_> = outcome.errors().map(|(index, _)| index).collect();
    assert_eq!(failed, vec![0, 2]);
    assert_eq!(outcome.results()[1].as_ref().map(|e| e.result()), Some("2"));
}

#[tokio::test]
async fn test_pre_cancelled_context_skips_guest() {
    let binding = binding(1).await;
    let before = binding.stats().guest_calls;

    let ctx = CallContext::background().with_cancel();
    ctx.cancel();

    let err = assert_err!(binding.parse(&ctx, "1+2").await);
    assert!(err.is_cancellation());
    assert!(matches!(err, BindingError::Cancelled));

    let (results, error) = binding.parse_concurrent(&ctx, &["1", "2"]).await;
    assert_eq!(results, vec![None, None]);
    assert!(error.is_some_and(|e| e.is_cancellation()));

    assert_eq!(binding.stats().guest_calls, before);
}

#[tokio::test]
async fn test_get_wasm_timestamp() {
    let binding = binding(1).await;

    let ts = assert_ok!(binding.get_wasm_timestamp(&CallContext::background()).await);
    let now = SystemTime::now();
    let skew = now
        .duration_since(ts)
        .or_else(|_| ts.duration_since(now))
        .unwrap();
    assert!(skew < Duration::from_secs(2), "skew {skew:?}");
}

#[tokio::test]
async fn test_must_parse() {
    let binding = binding(1).await;

    let expr = binding.must_parse("1+2").await;
    assert_eq!(expr.result(), "3");
}

#[tokio::test]
#[should_panic(expected = "must_parse")]
async fn test_must_parse_panics_on_invalid_input() {
    let binding = binding(1).await;
    binding.must_parse("1+").await;
}

#[tokio::test]
async fn test_closed_binding() {
    let binding = binding(1).await;
    binding.close();
    assert!(binding.is_closed());

    let err = assert_err!(binding.parse(&CallContext::background(), "1+2").await);
    assert!(matches!(err, BindingError::Closed));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    init_tracing();

    let mut config = RuntimeConfig::default();
    config.pool.pool_size = 0;

    let err = assert_err!(Binding::new(&config).await);
    assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
}

#[tokio::test]
async fn test_module_path_from_wat_file() {
    init_tracing();

    let config = RuntimeConfig::default();
    let dir = std::env::temp_dir().join(format!("wasm-calc-binding-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("calculator.wat");
    std::fs::write(&path, wasm_calc_core::CALCULATOR_WAT).unwrap();

    let mut from_file = config.clone();
    from_file.guest.module_path = Some(path.display().to_string());
    let binding = Binding::new(&from_file).await.unwrap();
    assert_eq!(binding.must_parse("6*7").await.result(), "42");

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_with_module_uses_compiling_engine() {
    init_tracing();

    let mut config = RuntimeConfig::default();
    config.pool.pool_size = 2;

    let engine = WasmEngine::new(&config.engine).unwrap();
    let module = CompiledModule::bundled(engine.inner()).unwrap();
    let binding = assert_ok!(Binding::with_module(&config, engine, module).await);

    assert_eq!(binding.pool_size(), 2);
    assert_eq!(binding.must_parse("6*7").await.result(), "42");
    assert_ok!(binding.get_wasm_timestamp(&CallContext::background()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stress_leaves_no_outstanding_allocations() {
    let binding = binding(4).await;
    let inputs = ["1+2", "2*(3+4)", "1+", "10/0", "((7))", "x", "-5*-5", ""];

    let mut handles = Vec::new();
    for task in 0..50 {
        let binding = binding.clone();
        handles.push(tokio::spawn(async move {
            let ctx = CallContext::background().with_timeout(Duration::from_secs(30));
            for round in 0..10 {
                let input = inputs[(task * 3 + round) % inputs.len()];
                match binding.parse(&ctx, input).await {
                    Ok(expr) => assert_eq!(expr.raw(), input),
                    Err(e) => assert!(e.is_parse(), "input {input:?} gave {e}"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = binding.stats();
    assert_eq!(stats.guest_calls, 500);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.recycled, 0);
    assert_eq!(stats.outstanding_allocations(), 0);
}
