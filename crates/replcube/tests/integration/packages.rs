use std::path::PathBuf;
use std::sync::Arc;

use replcube::{
    DirectoryPackageResolver, ExecutionRequest, ExternalReference, PackageResolver,
    SecurityPolicy, Value, codes,
};

use super::{FIXTURES_PATH, test_pipeline};

fn contoso() -> ExternalReference {
    ExternalReference::latest("Contoso.Json")
}

#[tokio::test]
async fn test_merge_into_initialized_session_discards_state() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 5;").persist(true))
        .await;
    let id = first.session_id.unwrap();

    let merged = pipeline
        .execute(
            ExecutionRequest::new("using Contoso.Json; 1")
                .in_session(id.as_str())
                .with_package(contoso()),
        )
        .await;
    assert!(merged.is_success(), "{:?}", merged.errors);
    assert!(merged.has_warning(codes::STATE_RESET));

    let meta = pipeline.registry().get_metadata(id.as_str()).unwrap();
    assert_eq!(meta.package_references.len(), 1);
    assert_eq!(meta.package_references[0].version.as_deref(), Some("1.10.0"));

    let after = pipeline
        .execute(ExecutionRequest::new("a").in_session(id.as_str()))
        .await;
    assert_eq!(after.errors[0].code, "CS0103");
}

#[tokio::test]
async fn test_merge_into_fresh_session_keeps_quiet() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(
            ExecutionRequest::new("using Contoso.Json; var n = 3;")
                .persist(true)
                .with_package(contoso()),
        )
        .await;
    assert!(result.is_success(), "{:?}", result.errors);
    assert!(result.warnings.is_empty());

    // same package again adds nothing, so state survives
    let id = result.session_id.unwrap();
    let again = pipeline
        .execute(
            ExecutionRequest::new("n")
                .in_session(id.as_str())
                .with_package(ExternalReference::new("contoso.json", Some("1.10.0".into()))),
        )
        .await;
    assert!(!again.has_warning(codes::STATE_RESET));
    assert_eq!(again.return_value, Some(Value::Int(3)));
}

#[tokio::test]
async fn test_partial_resolution_warns_and_continues() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(
            ExecutionRequest::new("using Contoso.Json; 7")
                .with_package(contoso())
                .with_package(ExternalReference::latest("Missing.Package")),
        )
        .await;

    assert!(result.is_success(), "{:?}", result.errors);
    assert_eq!(result.return_value, Some(Value::Int(7)));
    assert!(result.has_warning(codes::PACKAGE_NOT_FOUND));
}

#[tokio::test]
async fn test_nothing_resolves_is_an_error() {
    let (pipeline, compiler) = super::counting_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(
            ExecutionRequest::new("1")
                .with_package(ExternalReference::latest("Missing.Package"))
                .with_package(ExternalReference::new("Contoso.Json", Some("9.9.9".into()))),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.code == codes::PACKAGE_NOT_FOUND));
    assert_eq!(compiler.calls(), 0);
}

#[tokio::test]
async fn test_using_unknown_namespace_is_cs0246() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let result = pipeline
        .execute(ExecutionRequest::new("using Contoso.Json;"))
        .await;
    assert_eq!(result.errors[0].code, "CS0246");
}

#[tokio::test]
async fn test_load_packages_operation() {
    let pipeline = test_pipeline(SecurityPolicy::production());
    let first = pipeline
        .execute(ExecutionRequest::new("var a = 1;").persist(true))
        .await;
    let id = first.session_id.unwrap();

    let loaded = pipeline
        .load_packages(id.as_str(), &[ExternalReference::latest("Fabrikam.Text")])
        .await;
    assert!(loaded.success);
    assert_eq!(loaded.added.len(), 1);
    assert!(loaded.warnings.iter().any(|w| w.code == codes::STATE_RESET));

    let blocked = pipeline
        .load_packages(id.as_str(), &[ExternalReference::latest("System.Net.Sockets")])
        .await;
    assert!(!blocked.success);
    assert_eq!(blocked.errors[0].code, codes::FORBIDDEN_API);

    let missing = pipeline
        .load_packages("no-such-session", &[contoso()])
        .await;
    assert_eq!(missing.errors[0].code, codes::SESSION_NOT_FOUND);
}

#[tokio::test]
async fn test_directory_resolver_reads_fixture_cache() {
    let root = PathBuf::from(FIXTURES_PATH).join("packages");
    let resolver = DirectoryPackageResolver::new(&root);

    let latest = resolver
        .resolve(&ExternalReference::latest("contoso.json"))
        .await
        .unwrap();
    assert_eq!(latest.reference.name, "Contoso.Json");
    assert_eq!(latest.reference.version.as_deref(), Some("1.10.0"));
    assert_eq!(
        latest.artifacts,
        vec![
            root.join("Contoso.Json/1.10.0/Contoso.Json.dll"),
            root.join("Contoso.Json/1.10.0/Contoso.Json.xml"),
        ]
    );

    let pinned = resolver
        .resolve(&ExternalReference::new("Contoso.Json", Some("1.2.0".into())))
        .await
        .unwrap();
    assert_eq!(pinned.artifacts.len(), 1);

    assert!(
        resolver
            .resolve(&ExternalReference::latest("Nope"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_pipeline_with_directory_resolver() {
    let resolver = DirectoryPackageResolver::new(PathBuf::from(FIXTURES_PATH).join("packages"));
    let pipeline = test_pipeline(SecurityPolicy::production()).with_resolver(Arc::new(resolver));

    let result = pipeline
        .execute(
            ExecutionRequest::new("using Fabrikam.Text; \"ok\"")
                .with_package(ExternalReference::latest("Fabrikam.Text")),
        )
        .await;
    assert!(result.is_success(), "{:?}", result.errors);
    assert_eq!(result.return_value, Some(Value::Str("ok".into())));
}
