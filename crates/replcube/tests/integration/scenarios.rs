use replcube::{ExecutionRequest, ResetOutcome, SecurityPolicy, Severity, Value, codes};

use super::test_pipeline;

#[tokio::test]
async fn test_value_then_undefined_name() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("2 + 2").persist(true))
        .await;
    assert!(first.is_success());
    assert_eq!(first.return_value, Some(Value::Int(4)));
    let id = first.session_id.unwrap();

    let second = pipeline
        .execute(ExecutionRequest::new("x").in_session(id.as_str()))
        .await;
    assert!(!second.success);
    let error = &second.errors[0];
    assert_eq!(error.code, "CS0103");
    assert_eq!(error.severity, Severity::Error);
    assert_eq!((error.line, error.column), (Some(1), Some(1)));
}

#[tokio::test]
async fn test_compile_errors_are_all_reported() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(ExecutionRequest::new("var a = b;\nvar c = d;"))
        .await;

    assert!(!result.success);
    let codes: Vec<&str> = result.errors.iter().map(|e| e.code.as_str()).collect();
    assert_eq!(codes, vec!["CS0103", "CS0103"]);
    assert_eq!(result.errors[1].line, Some(2));
}

#[tokio::test]
async fn test_deeply_nested_source_is_a_compile_error() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let source = format!("{}1{}", "(".repeat(15_000), ")".repeat(15_000));
    let result = pipeline.execute(ExecutionRequest::new(source)).await;

    assert!(!result.success);
    assert!(result.has_error("CS8078"));
    assert_eq!(pipeline.domain().stats().loaded, 0);

    let result = pipeline
        .execute(ExecutionRequest::new(format!("{}1", "-".repeat(60_000))))
        .await;
    assert!(result.has_error("CS8078"));

    let result = pipeline.execute(ExecutionRequest::new("1 + 1")).await;
    assert_eq!(result.return_value, Some(Value::Int(2)));
}

#[tokio::test]
async fn test_failed_run_persists_nothing() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 1;").persist(true))
        .await;
    let id = first.session_id.unwrap();

    let failed = pipeline
        .execute(
            ExecutionRequest::new("a = 100; var b = 2; throw new Exception(\"stop\");")
                .in_session(id.as_str()),
        )
        .await;
    assert!(failed.has_error(codes::RUNTIME_ERROR));

    let check = pipeline
        .execute(ExecutionRequest::new("a").in_session(id.as_str()))
        .await;
    assert_eq!(check.return_value, Some(Value::Int(1)));
    let meta = pipeline.registry().get_metadata(id.as_str()).unwrap();
    assert_eq!(meta.execution_count, 2);
}

#[tokio::test]
async fn test_warnings_travel_with_success() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(ExecutionRequest::new("using System; using System; Task.Delay(10); 1"))
        .await;

    assert!(result.is_success(), "{:?}", result.errors);
    let codes: Vec<&str> = result.warnings.iter().map(|w| w.code.as_str()).collect();
    assert!(codes.contains(&"CS0105"));
    assert!(codes.contains(&"CS4014"));
}

#[tokio::test]
async fn test_validate_uses_session_state() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 5;").persist(true))
        .await;
    let id = first.session_id.unwrap();

    let with_session = pipeline.validate("a * 2", Some(id.as_str())).await;
    assert!(with_session.is_valid, "{:?}", with_session.errors);

    let without = pipeline.validate("a * 2", None).await;
    assert!(!without.is_valid);

    let unknown = pipeline.validate("1", Some("missing")).await;
    assert_eq!(unknown.errors[0].code, codes::SESSION_NOT_FOUND);

    let forbidden = pipeline.validate("Environment.Exit(1);", None).await;
    assert_eq!(forbidden.errors[0].code, codes::FORBIDDEN_API);

    // validation never runs code or counts as an execution
    let meta = pipeline.registry().get_metadata(id.as_str()).unwrap();
    assert_eq!(meta.execution_count, 1);
    assert_eq!(pipeline.registry().len(), 1);
    assert_eq!(pipeline.domain().stats().loaded, 1);
}

#[tokio::test]
async fn test_inspect_and_list_sessions() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 1;").persist(true))
        .await;
    pipeline
        .execute(ExecutionRequest::new("var b = 2;").persist(true))
        .await;

    let sessions = pipeline.list_sessions();
    assert_eq!(sessions.len(), 2);
    assert!(sessions.iter().all(|s| s.is_initialized && s.execution_count == 1));

    let state = pipeline
        .inspect(first.session_id.as_ref().map(|id| id.as_str()))
        .unwrap();
    assert_eq!(state.active_sessions, 2);
    assert_eq!(state.isolation.loaded, 2);
    assert_eq!(state.isolation.live, 0);
    assert!(state.policy.api_restrictions_enabled());
    assert_eq!(state.session.unwrap().id, first.session_id.unwrap());

    let json = serde_json::to_value(pipeline.inspect(None).unwrap()).unwrap();
    assert_eq!(json["engine"]["language"], "csharp-script");
    assert!(json["session"].is_null());
}

#[tokio::test]
async fn test_reset_clears_sessions() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 1;").persist(true))
        .await;
    let id = first.session_id.unwrap();
    pipeline
        .execute(ExecutionRequest::new("var b = 1;").persist(true))
        .await;

    assert_eq!(
        pipeline.reset(Some(id.as_str())),
        ResetOutcome::Session {
            id: id.to_string(),
            removed: true
        }
    );
    assert_eq!(
        pipeline.reset(Some(id.as_str())),
        ResetOutcome::Session {
            id: id.to_string(),
            removed: false
        }
    );
    assert_eq!(pipeline.reset(None), ResetOutcome::All { removed: 1 });

    let gone = pipeline
        .execute(ExecutionRequest::new("a").in_session(id.as_str()))
        .await;
    assert!(gone.has_error(codes::SESSION_NOT_FOUND));
}

#[tokio::test]
async fn test_result_serializes_for_callers() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(ExecutionRequest::new("Console.Write(\"hi\"); true"))
        .await;
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["success"], true);
    assert_eq!(json["return_value"], true);
    assert_eq!(json["output"], "hi");
    assert!(json["session_id"].is_null());
}
