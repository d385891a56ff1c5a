use lake_acl_core::backend::memory::{CallKind, BASE_ENTRIES};
use lake_acl_core::backend::AclBackend;
use lake_acl_core::{AclDocument, MemoryBackend, Reconciler};
use std::sync::Arc;

const DOCUMENT: &str = r#"
account: examplelake
containers:
  - name: sales
    acls:
      - type: group
        oid: 0c3a1e10-readers
        default_acl: r-x
    folders:
      - name: eu
        acls:
          - type: user
            oid: 7f00aa01-analyst
            acl: rw-
            recursive: true
        folders:
          - name: archive
            acls: []
"#;

#[tokio::test]
async fn applied_document_reads_back() {
    let document = AclDocument::from_yaml(DOCUMENT).unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.add_file("sales", "eu/report.parquet", BASE_ENTRIES).unwrap();
    let reconciler = Reconciler::new(backend.clone());

    for mut tree in document.trees().unwrap() {
        reconciler.apply(&mut tree).await.unwrap();
    }
    assert_eq!(backend.calls_of(CallKind::UpdateRecursive).len(), 1);

    let file = backend.entries("sales", "eu/report.parquet").unwrap();
    assert!(file
        .iter()
        .any(|e| e.principal_id() == "7f00aa01-analyst" && e.permissions().as_str() == "rw-"));

    let handle = backend.create_container_if_absent("sales").await.unwrap();
    let tree = reconciler.snapshot_container(&handle, true).await.unwrap();
    let exported = tree.to_document(tree.root());

    assert_eq!(exported.name, "sales");
    assert_eq!(exported.folders.len(), 1);
    let eu = &exported.folders[0];
    assert_eq!(eu.name, "eu");
    assert!(eu
        .acls
        .iter()
        .any(|e| e.oid.as_deref() == Some("7f00aa01-analyst") && e.acl.as_deref() == Some("rw-")));
    assert_eq!(eu.folders[0].name, "archive");
}

#[test]
fn unknown_keys_are_rejected() {
    let err = AclDocument::from_yaml("account: a\ncontainers:\n  - name: c\n    colour: blue\n")
        .unwrap_err();
    assert!(err.to_string().contains("colour"));
}
