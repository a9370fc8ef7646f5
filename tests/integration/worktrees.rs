//! Worktree lifecycle against a real repository.

use std::sync::Arc;

use locus::git::GitCli;
use locus::worktree::{WorktreeManager, WorktreeStatus};

use super::fixtures::{git, TestRepo};

fn manager() -> WorktreeManager {
    WorktreeManager::new(Arc::new(GitCli::new()), ".locus/worktrees", "locus")
}

/// Test: Stale branch is replaced
/// Given a leftover `locus/issue-7` branch with its own commit
/// When the worktree for task 7 is created
/// Then the branch is recreated from main and no error is raised
#[test]
fn test_create_replaces_stale_branch() {
    let repo = TestRepo::new();
    repo.create_branch_with_commit("locus/issue-7", "old.txt");
    let main_head = repo.rev_parse("main").unwrap();
    assert_ne!(repo.rev_parse("locus/issue-7").unwrap(), main_head);

    let info = manager().create(&repo.path, "7", "main").unwrap();

    assert_eq!(info.status, WorktreeStatus::Active);
    assert_eq!(info.branch, "locus/issue-7");
    assert!(info.path.join("README.md").exists());
    assert!(!info.path.join("old.txt").exists());
    assert_eq!(repo.rev_parse("locus/issue-7").unwrap(), main_head);
}

#[test]
fn test_create_is_idempotent() {
    let repo = TestRepo::new();
    let worktrees = manager();

    let first = worktrees.create(&repo.path, "12", "main").unwrap();
    std::fs::write(first.path.join("work.txt"), "in progress").unwrap();
    let second = worktrees.create(&repo.path, "12", "main").unwrap();

    assert_eq!(first.path, second.path);
    assert_eq!(second.status, WorktreeStatus::Active);
    assert!(second.path.join("work.txt").exists());
}

#[test]
fn test_remove_deletes_checkout_and_branch() {
    let repo = TestRepo::new();
    let worktrees = manager();
    let info = worktrees.create(&repo.path, "3", "main").unwrap();
    // Uncommitted changes force the fallback path
    std::fs::write(info.path.join("dirty.txt"), "x").unwrap();

    worktrees.remove(&repo.path, "3");

    assert!(!info.path.exists());
    assert!(!repo.branch_exists("locus/issue-3"));
    let listed = git(&repo.path, &["worktree", "list", "--porcelain"]);
    assert!(!listed.contains("issue-3"));
}

#[test]
fn test_remove_missing_worktree_is_silent() {
    let repo = TestRepo::new();
    manager().remove(&repo.path, "never-created");
}

/// Test: Unregistered directories are reported stale and cleaned
/// Given one real worktree and one leftover directory git does not know
/// When listing and cleaning up
/// Then only the leftover is stale and only it is removed
#[test]
fn test_list_and_cleanup_stale() {
    let repo = TestRepo::new();
    let worktrees = manager();
    let active = worktrees.create(&repo.path, "1", "main").unwrap();
    let leftover = worktrees.worktree_path(&repo.path, "2");
    std::fs::create_dir_all(&leftover).unwrap();
    std::fs::create_dir_all(worktrees.worktree_root(&repo.path).join("not-a-task")).unwrap();

    let listed = worktrees.list(&repo.path).unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].task_ref, "1");
    assert_eq!(listed[0].status, WorktreeStatus::Active);
    assert_eq!(listed[0].branch, "locus/issue-1");
    assert_eq!(listed[1].task_ref, "2");
    assert_eq!(listed[1].status, WorktreeStatus::Stale);

    assert_eq!(worktrees.cleanup_stale(&repo.path).unwrap(), 1);
    assert!(active.path.exists());
    assert!(!leftover.exists());
    assert_eq!(worktrees.cleanup_stale(&repo.path).unwrap(), 0);
}

#[test]
fn test_unsafe_refs_are_sanitized() {
    let repo = TestRepo::new();
    let worktrees = manager();
    let info = worktrees.create(&repo.path, "feat/x y", "main").unwrap();
    assert!(info.branch.starts_with("locus/issue-feat-x-y-"));
    assert!(repo.branch_exists(&info.branch));

    // A ref that sanitizes to the same text gets its own checkout
    let plain = worktrees.create(&repo.path, "feat-x-y", "main").unwrap();
    assert_eq!(plain.branch, "locus/issue-feat-x-y");
    assert_ne!(plain.path, info.path);
    std::fs::write(plain.path.join("work.txt"), "x").unwrap();
    worktrees.remove(&repo.path, "feat/x y");
    assert!(plain.path.join("work.txt").exists());
}

/// Test: A leftover directory is replaced by a real checkout
/// Given a plain directory at the task's worktree path that git does not know
/// When the worker's checkout is prepared
/// Then the directory is replaced by a registered worktree on the task branch
#[test]
fn test_create_fresh_replaces_leftover_directory() {
    let repo = TestRepo::new();
    let worktrees = manager();
    let path = worktrees.worktree_path(&repo.path, "5");
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join("junk.txt"), "left behind").unwrap();
    assert_eq!(
        worktrees.create(&repo.path, "5", "main").unwrap().status,
        WorktreeStatus::Stale
    );

    let info = worktrees.create_fresh(&repo.path, "5", "main").unwrap();

    assert_eq!(info.status, WorktreeStatus::Active);
    assert!(info.path.join("README.md").exists());
    assert!(!info.path.join("junk.txt").exists());
    assert!(repo.branch_exists("locus/issue-5"));
    let listed = git(&repo.path, &["worktree", "list", "--porcelain"]);
    assert!(listed.contains("issue-5"));
}
