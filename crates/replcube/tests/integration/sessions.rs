use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use replcube::{
    ExecutionRequest, PipelineSettings, SecurityPolicy, SessionError, SessionRegistry, Value,
    codes,
};
use tokio_util::sync::CancellationToken;

use super::test_pipeline;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_yield_distinct_ids() {
    let registry = Arc::new(SessionRegistry::new());
    let handles: Vec<_> = (0..64)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.create() })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 64);
    assert_eq!(registry.list_active(), ids);
}

#[tokio::test]
async fn test_removed_session_is_not_found() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 1;").persist(true))
        .await;
    let id = first.session_id.unwrap();

    assert!(pipeline.registry().remove(id.as_str()));
    assert_eq!(
        pipeline.registry().get_state(id.as_str()).unwrap_err(),
        SessionError::NotFound(id.to_string())
    );

    let result = pipeline
        .execute(ExecutionRequest::new("a").in_session(id.as_str()))
        .await;
    assert!(!result.success);
    assert!(result.has_error(codes::SESSION_NOT_FOUND));
}

#[tokio::test]
async fn test_state_continuity() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 5;").persist(true))
        .await;
    assert!(first.is_success(), "{:?}", first.errors);
    assert_eq!(first.return_value, None);
    let id = first.session_id.unwrap();

    let second = pipeline
        .execute(ExecutionRequest::new("a + 1").in_session(id.as_str()))
        .await;
    assert!(second.is_success(), "{:?}", second.errors);
    assert_eq!(second.return_value, Some(Value::Int(6)));
    assert_eq!(second.session_id, Some(id));
}

#[tokio::test]
async fn test_sessions_do_not_share_state() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let a = pipeline
        .execute(ExecutionRequest::new("var shared = 1;").persist(true))
        .await;
    assert!(a.is_success());
    let b = pipeline
        .execute(ExecutionRequest::new("var other = 2;").persist(true))
        .await;
    let b_id = b.session_id.unwrap();
    assert_ne!(a.session_id.as_ref(), Some(&b_id));

    let result = pipeline
        .execute(ExecutionRequest::new("shared").in_session(b_id.as_str()))
        .await;
    assert!(!result.success);
    assert_eq!(result.errors[0].code, "CS0103");
}

#[tokio::test]
async fn test_ephemeral_requests_leave_nothing_behind() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let requests = [
        "var x = 1; x",
        "undefined_name",
        "throw new Exception(\"boom\");",
        "System.Diagnostics.Process.Start(\"sh\")",
    ];
    for source in requests {
        let result = pipeline.execute(ExecutionRequest::new(source)).await;
        assert_eq!(result.session_id, None, "{source}");
        assert!(pipeline.registry().is_empty(), "{source} left a session");
    }

    let stats = pipeline.domain().stats();
    assert_eq!(stats.live, 0);
}

#[tokio::test]
async fn test_sweep_removes_exactly_expired_sessions() {
    let registry = SessionRegistry::new();
    let old = registry.create();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let fresh = registry.create();

    let old_seen = registry.get_metadata(old.as_str()).unwrap().last_accessed_at;
    let fresh_seen = registry.get_metadata(fresh.as_str()).unwrap().last_accessed_at;
    let idle_gap = (fresh_seen - old_seen).to_std().unwrap();
    assert!(idle_gap >= Duration::from_millis(30));

    let removed = registry.sweep_expired_at(fresh_seen, idle_gap / 2);
    assert_eq!(removed, 1);
    assert!(!registry.exists(old.as_str()));
    assert!(registry.exists(fresh.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_session_requests_are_serialized() {
    let pipeline = Arc::new(test_pipeline(SecurityPolicy::production()));
    let setup = pipeline
        .execute(ExecutionRequest::new("var n = 0;").persist(true))
        .await;
    let id = setup.session_id.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            let id = id.to_string();
            tokio::spawn(async move {
                pipeline
                    .execute(
                        ExecutionRequest::new("var before = n; await Task.Delay(5); n = before + 1;")
                            .in_session(id),
                    )
                    .await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_success(), "{:?}", result.errors);
    }

    let result = pipeline
        .execute(ExecutionRequest::new("n").in_session(id.as_str()))
        .await;
    assert_eq!(result.return_value, Some(Value::Int(8)));
    let meta = pipeline.registry().get_metadata(id.as_str()).unwrap();
    assert_eq!(meta.execution_count, 10);
}

#[tokio::test]
async fn test_blank_session_id_is_treated_as_absent() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let mut request = ExecutionRequest::new("1 + 1");
    request.session_id = Some("   ".to_string());

    let result = pipeline.execute(request).await;
    assert!(result.is_success());
    assert_eq!(result.session_id, None);
    assert!(pipeline.registry().is_empty());
}

#[tokio::test]
async fn test_background_sweeper_expires_idle_sessions() {
    let pipeline = test_pipeline(SecurityPolicy::production()).with_settings(PipelineSettings {
        session_ttl: Duration::from_millis(1),
        sweep_interval: Duration::from_millis(10),
        ..PipelineSettings::default()
    });
    let cancel = CancellationToken::new();
    let sweeper = pipeline.spawn_sweeper(cancel.clone());

    pipeline.registry().create();
    pipeline.registry().create();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pipeline.registry().is_empty());

    cancel.cancel();
    sweeper.await.unwrap();
}
