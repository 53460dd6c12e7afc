use replcube::{
    ExecutionRequest, ExternalReference, GuardViolation, SecurityPolicy, StaticGuard, codes,
};

use super::{counting_pipeline, test_pipeline};

#[tokio::test]
async fn test_blocked_package_rejected_before_compile() {
    let (pipeline, compiler) = counting_pipeline(SecurityPolicy::production());
    let request = ExecutionRequest::new("1 + 1")
        .with_package(ExternalReference::latest("System.Net.Sockets"));

    let result = pipeline.execute(request).await;
    assert!(!result.success);
    assert!(result.has_error(codes::FORBIDDEN_API));
    assert_eq!(compiler.calls(), 0);
    assert_eq!(pipeline.domain().stats().loaded, 0);
}

#[tokio::test]
async fn test_blocked_library_in_source_rejected_before_compile() {
    let (pipeline, compiler) = counting_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(ExecutionRequest::new("var s = System . Net . Sockets.Socket;"))
        .await;

    assert!(!result.success);
    let error = &result.errors[0];
    assert_eq!(error.code, codes::FORBIDDEN_API);
    assert_eq!(error.line, Some(1));
    assert_eq!(compiler.calls(), 0);
}

#[tokio::test]
async fn test_blocked_library_through_alias_rejected_before_compile() {
    let (pipeline, compiler) = counting_pipeline(SecurityPolicy::production());
    let source = "using N = System.Net;\nvar c = new N.Sockets.TcpClient();";
    let result = pipeline.execute(ExecutionRequest::new(source)).await;

    assert!(!result.success);
    let error = &result.errors[0];
    assert_eq!(error.code, codes::FORBIDDEN_API);
    assert_eq!(error.line, Some(2));
    assert!(error.message.contains("System.Net.Sockets"));
    assert_eq!(compiler.calls(), 0);
}

#[tokio::test]
async fn test_forbidden_api_rejected() {
    let (pipeline, compiler) = counting_pipeline(SecurityPolicy::production());
    let source = "Console.WriteLine(1);\n// Process.Start is fine in a comment\nProcess.Start(\"calc\");";
    let result = pipeline.execute(ExecutionRequest::new(source)).await;

    assert!(result.has_error(codes::FORBIDDEN_API));
    assert_eq!(result.errors[0].line, Some(3));
    assert!(result.output.is_empty());
    assert_eq!(compiler.calls(), 0);
}

#[tokio::test]
async fn test_blocked_path_literal_rejected() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    for source in [
        "var p = \"/etc/passwd\";",
        "var p = \"/tmp/../etc/shadow\";",
    ] {
        let result = pipeline.execute(ExecutionRequest::new(source)).await;
        assert!(result.has_error(codes::FORBIDDEN_API), "{source}");
    }
}

#[tokio::test]
async fn test_allow_list_restricts_paths() {
    let policy = SecurityPolicy::production().with_allowed_paths(["/tmp/replcube"]);
    let pipeline = test_pipeline(policy);

    let inside = pipeline
        .execute(ExecutionRequest::new("var p = \"/tmp/replcube/data.txt\"; p"))
        .await;
    assert!(inside.is_success(), "{:?}", inside.errors);

    let outside = pipeline
        .execute(ExecutionRequest::new("var p = \"/home/user/data.txt\"; p"))
        .await;
    assert!(outside.has_error(codes::FORBIDDEN_API));
}

#[tokio::test]
async fn test_permissive_policy_skips_api_rules() {
    let (pipeline, compiler) = counting_pipeline(SecurityPolicy::permissive());
    let result = pipeline
        .execute(ExecutionRequest::new("var p = \"/etc/hosts\"; p"))
        .await;

    assert!(result.is_success(), "{:?}", result.errors);
    assert_eq!(compiler.calls(), 1);
}

#[tokio::test]
async fn test_oversize_source_rejected_under_any_policy() {
    let policy = SecurityPolicy::permissive().with_max_source_bytes(32);
    let (pipeline, compiler) = counting_pipeline(policy);
    let source = format!("var s = \"{}\";", "x".repeat(64));

    let result = pipeline.execute(ExecutionRequest::new(source)).await;
    assert!(result.has_error(codes::FORBIDDEN_API));
    assert_eq!(compiler.calls(), 0);
}

#[test]
fn test_guard_fails_closed_on_unterminated_input() {
    let policy = SecurityPolicy::production();
    assert!(matches!(
        StaticGuard::check("var s = \"never closed", &policy),
        Err(GuardViolation::Unscannable { .. })
    ));
    assert!(matches!(
        StaticGuard::check("1 /* never closed", &policy),
        Err(GuardViolation::Unscannable { .. })
    ));
}

#[test]
fn test_guard_matching_ignores_case() {
    let policy = SecurityPolicy::production();
    assert!(StaticGuard::check("process.start(\"x\")", &policy).is_err());
    assert!(
        StaticGuard::check_packages(&[ExternalReference::latest("system.management")], &policy)
            .is_err()
    );
}
