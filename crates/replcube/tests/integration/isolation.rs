use std::sync::Arc;
use std::time::Duration;

use replcube::{
    ExecutionRequest, IsolationDomain, ResourceMonitor, SecurityPolicy, Value, codes,
};
use tokio_util::sync::CancellationToken;

use super::test_pipeline;

#[tokio::test]
async fn test_timeout_reported() {
    let policy = SecurityPolicy::production().with_execution_timeout(Duration::from_millis(100));
    let pipeline = test_pipeline(policy);

    let result = pipeline
        .execute(ExecutionRequest::new(
            "Console.WriteLine(\"started\");\nawait Task.Delay(60000);\n1",
        ))
        .await;

    assert!(!result.success);
    assert!(result.has_error(codes::TIMEOUT));
    let message = &result.errors[0].message;
    assert!(message.contains("time limit of 100 ms"), "{message}");
    assert!(message.contains("stopped waiting"), "{message}");
    assert!(message.contains("never yields"), "{message}");
    assert_eq!(result.output, "started\n");
    assert!(!result.cleanup_degraded);
    assert!(result.warnings.is_empty());
    assert!(result.elapsed < Duration::from_secs(5));
}

#[tokio::test]
async fn test_timeout_does_not_persist_state() {
    let policy = SecurityPolicy::production().with_execution_timeout(Duration::from_millis(50));
    let pipeline = test_pipeline(policy);
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 1;").persist(true))
        .await;
    let id = first.session_id.unwrap();

    let slow = pipeline
        .execute(ExecutionRequest::new("a = 2; await Task.Delay(-1);").in_session(id.as_str()))
        .await;
    assert!(slow.has_error(codes::TIMEOUT));

    let after = pipeline
        .execute(ExecutionRequest::new("a").in_session(id.as_str()))
        .await;
    assert_eq!(after.return_value, Some(Value::Int(1)));
}

#[tokio::test]
async fn test_caller_abort_reported_as_cancelled() {
    let pipeline = Arc::new(test_pipeline(SecurityPolicy::production()));
    let abort = CancellationToken::new();

    let task = {
        let pipeline = Arc::clone(&pipeline);
        let abort = abort.clone();
        tokio::spawn(async move {
            pipeline
                .execute_with_abort(ExecutionRequest::new("await Task.Delay(60000);"), abort)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    abort.cancel();

    let result = task.await.unwrap();
    assert!(!result.success);
    assert!(result.has_error(codes::CANCELLED));
    assert!(result.errors[0].message.contains("never yields"));
    assert!(pipeline.registry().is_empty());
}

#[tokio::test]
async fn test_already_aborted_request_never_runs() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let abort = CancellationToken::new();
    abort.cancel();

    let result = pipeline
        .execute_with_abort(ExecutionRequest::new("Console.WriteLine(1);"), abort)
        .await;
    assert!(result.has_error(codes::CANCELLED));
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_memory_ceiling_below_usage_is_exceeded() {
    if ResourceMonitor::current_usage().is_none() {
        return;
    }
    let policy = SecurityPolicy::production().with_max_memory_bytes(1);
    let pipeline = test_pipeline(policy);

    let result = pipeline
        .execute(ExecutionRequest::new("await Task.Delay(10000);"))
        .await;
    assert!(result.has_error(codes::MEMORY_LIMIT));
}

#[test]
fn test_zero_memory_ceiling_is_never_exceeded() {
    let monitor = ResourceMonitor::new(0);
    assert!(!monitor.exceeds(u64::MAX));
    assert!(!monitor.is_exceeded());

    let disabled = SecurityPolicy::production().with_memory_limit_enabled(false);
    assert_eq!(ResourceMonitor::from_policy(&disabled).limit(), 0);
}

#[tokio::test]
async fn test_every_unit_is_released() {
    let policy = SecurityPolicy::production().with_execution_timeout(Duration::from_millis(50));
    let pipeline = test_pipeline(policy);
    let sources = [
        "2 + 2",
        "var z = 0; 1 / z",
        "throw new InvalidOperationException(\"no\");",
        "await Task.Delay(5000);",
        "Console.WriteLine(\"hi\");",
    ];
    for source in sources {
        pipeline.execute(ExecutionRequest::new(source)).await;
    }
    // compile errors never load a unit
    pipeline.execute(ExecutionRequest::new("nope")).await;

    let stats = pipeline.domain().stats();
    assert_eq!(stats.loaded, sources.len() as u64);
    assert_eq!(stats.released, stats.loaded);
    assert_eq!(stats.live, 0);
    assert_eq!(stats.available, stats.capacity);
}

#[tokio::test]
async fn test_closed_domain_reports_unavailable() {
    let domain = Arc::new(IsolationDomain::new(2));
    let pipeline = test_pipeline(SecurityPolicy::production()).with_domain(Arc::clone(&domain));
    domain.close();

    let result = pipeline.execute(ExecutionRequest::new("1")).await;
    assert!(!result.success);
    assert!(result.has_error(codes::ISOLATION_UNAVAILABLE));
}

#[tokio::test]
async fn test_runtime_fault_keeps_output() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(ExecutionRequest::new(
            "Console.WriteLine(\"partial\");\nvar z = 0;\nvar q = 10 / z;",
        ))
        .await;

    assert!(!result.success);
    assert!(result.has_error(codes::RUNTIME_ERROR));
    assert!(result.errors[0].message.contains("DivideByZeroException"));
    assert_eq!(result.output, "partial\n");
}
