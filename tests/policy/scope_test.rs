//! Scope and root enforcement against real directories.

use std::path::Path;
use std::sync::Arc;

use switchboard::audit::AuditLog;
use switchboard::broker::{AccessBroker, Session};
use switchboard::config::BrokerConfig;
use switchboard::scope::{authorize, Denied, Operation, SCOPE_READ_FILES, SCOPE_WRITE_FILES};

fn session(scopes: &[&str], root: &Path) -> Session {
    let broker = AccessBroker::new(BrokerConfig::default(), Arc::new(AuditLog::discard()));
    let request = broker
        .submit_request("agent", scopes.iter().copied(), [root], "")
        .expect("submit");
    broker
        .approve(&request.request_id, None, None)
        .expect("approve")
        .session
}

#[test]
fn paths_under_the_root_are_allowed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("repo");
    std::fs::create_dir_all(root.join("src")).expect("mkdir");
    std::fs::write(root.join("src/lib.rs"), "").expect("write");
    let session = session(&[SCOPE_READ_FILES, SCOPE_WRITE_FILES], &root);

    let existing =
        Operation::new("read_file", SCOPE_READ_FILES).with_path(root.join("src/lib.rs"));
    assert_eq!(authorize(&session, &existing), Ok(()));

    // Not yet on disk, as for a file about to be created.
    let fresh =
        Operation::new("create_file", SCOPE_WRITE_FILES).with_path(root.join("src/new/mod.rs"));
    assert_eq!(authorize(&session, &fresh), Ok(()));

    let the_root = Operation::new("list_directory", SCOPE_READ_FILES).with_path(&root);
    assert_eq!(authorize(&session, &the_root), Ok(()));
}

#[test]
fn scope_must_be_approved() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let session = session(&[SCOPE_READ_FILES], tmp.path());
    let op = Operation::new("write_file", SCOPE_WRITE_FILES).with_path(tmp.path().join("a.txt"));
    assert_eq!(
        authorize(&session, &op),
        Err(Denied::ScopeNotApproved(SCOPE_WRITE_FILES.to_owned()))
    );
}

#[test]
fn dot_dot_cannot_escape_the_root() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("repo");
    std::fs::create_dir_all(&root).expect("mkdir");
    let session = session(&[SCOPE_READ_FILES], &root);

    let op = Operation::new("read_file", SCOPE_READ_FILES).with_path(root.join("../secrets.txt"));
    assert!(matches!(authorize(&session, &op), Err(Denied::OutsideRoots(_))));
}

#[test]
fn sibling_with_shared_prefix_is_outside() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("repo");
    let sibling = tmp.path().join("repo-backup");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::create_dir_all(&sibling).expect("mkdir");
    let session = session(&[SCOPE_READ_FILES], &root);

    let op = Operation::new("read_file", SCOPE_READ_FILES).with_path(sibling.join("a.rs"));
    assert!(matches!(authorize(&session, &op), Err(Denied::OutsideRoots(_))));
}

#[test]
fn relative_paths_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let session = session(&[SCOPE_READ_FILES], tmp.path());
    let op = Operation::new("read_file", SCOPE_READ_FILES).with_path("src/lib.rs");
    assert_eq!(
        authorize(&session, &op),
        Err(Denied::RelativePath("src/lib.rs".to_owned()))
    );
}

#[cfg(unix)]
#[test]
fn symlink_out_of_the_root_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("repo");
    let outside = tmp.path().join("outside");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::create_dir_all(&outside).expect("mkdir");
    std::fs::write(outside.join("secret.txt"), "s3cr3t").expect("write");
    std::os::unix::fs::symlink(&outside, root.join("link")).expect("symlink");
    let session = session(&[SCOPE_READ_FILES, SCOPE_WRITE_FILES], &root);

    let read =
        Operation::new("read_file", SCOPE_READ_FILES).with_path(root.join("link/secret.txt"));
    assert!(matches!(authorize(&session, &read), Err(Denied::OutsideRoots(_))));

    // Also for targets that do not exist yet.
    let create =
        Operation::new("create_file", SCOPE_WRITE_FILES).with_path(root.join("link/new.txt"));
    assert!(matches!(authorize(&session, &create), Err(Denied::OutsideRoots(_))));
}

#[cfg(unix)]
#[test]
fn dot_dot_after_symlink_climbs_from_the_link_target() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("repo");
    let outside = tmp.path().join("outside");
    std::fs::create_dir_all(&root).expect("mkdir");
    std::fs::create_dir_all(outside.join("sub")).expect("mkdir");
    std::fs::write(outside.join("secret"), "s3cret").expect("write");
    std::fs::write(root.join("secret"), "decoy").expect("write");
    std::os::unix::fs::symlink(outside.join("sub"), root.join("link")).expect("symlink");
    let session = session(&[SCOPE_READ_FILES], &root);

    // The OS resolves repo/link/../secret to outside/secret.
    let target = root.join("link/../secret");
    assert_eq!(std::fs::read_to_string(&target).expect("read"), "s3cret");

    let op = Operation::new("read_file", SCOPE_READ_FILES).with_path(&target);
    assert!(matches!(authorize(&session, &op), Err(Denied::OutsideRoots(_))));
}

#[test]
fn rename_checks_both_paths() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path().join("repo");
    std::fs::create_dir_all(&root).expect("mkdir");
    let session = session(&[SCOPE_WRITE_FILES], &root);

    let cmd = switchboard::relay::envelope::Command::new(
        "m1",
        "rename_file",
        serde_json::json!({
            "path": root.join("a.rs"),
            "new_path": tmp.path().join("stolen.rs"),
        }),
    );
    let op = Operation::from_command(&cmd).expect("known action");
    assert_eq!(op.paths.len(), 2);
    assert!(matches!(authorize(&session, &op), Err(Denied::OutsideRoots(_))));
}
