//! Git codebase fetching.
//!
//! Clones run on the blocking thread pool; libgit2 is synchronous. A branch
//! turns the clone into a shallow single-branch clone. A requested commit is
//! checked out after the clone; if the object is missing (shallow clone,
//! unadvertised ref) all heads and tags are fetched once and the checkout is
//! retried.

use crate::error::{FetchErrorKind, KilnError, Result};
use crate::notify::BuildLogger;
use crate::spec::Codebase;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{ErrorClass, ErrorCode, FetchOptions, Repository};
use std::path::Path;
use tracing::{debug, info};

/// Clone the codebase's repository into `dest_dir` (which must not exist)
/// and position the worktree on the requested branch/commit.
pub async fn fetch_git(codebase: &Codebase, dest_dir: &Path, logger: &BuildLogger) -> Result<()> {
    let name = codebase.name.clone();
    let url = codebase.source.clone();
    let branch = codebase.branch.clone();
    let commit = codebase.commit.clone();
    let dest = dest_dir.to_path_buf();

    logger.system(&format!("Cloning repository {} into {}", url, dest.display()));

    let cloned_name = name.clone();
    let checked_out = tokio::task::spawn_blocking(move || {
        clone_and_checkout(&cloned_name, &url, branch.as_deref(), commit.as_deref(), &dest)
    })
    .await
    .map_err(|e| KilnError::Internal(format!("git clone task failed: {}", e)))??;

    if let Some(commit) = &codebase.commit {
        logger.system(&format!("Checking out commit {}", commit));
    }
    if let Some(head) = checked_out {
        debug!(codebase = %name, head = %head, "Repository cloned");
        logger.system(&format!("Repository cloned successfully (HEAD: {})", head));
    } else {
        logger.system("Repository cloned successfully");
    }
    Ok(())
}

fn clone_and_checkout(
    codebase: &str,
    url: &str,
    branch: Option<&str>,
    commit: Option<&str>,
    dest: &Path,
) -> Result<Option<String>> {
    let mut fetch_options = FetchOptions::new();
    fetch_options.download_tags(git2::AutotagOption::None);

    let mut builder = RepoBuilder::new();
    if let Some(branch) = branch {
        // Shallow single-branch clone when a branch is pinned.
        fetch_options.depth(1);
        builder.branch(branch);
    }
    builder.fetch_options(fetch_options);

    info!(url = %url, "Cloning repository");
    let repo = builder
        .clone(url, dest)
        .map_err(|e| classify_git_error(codebase, url, e))?;

    if let Some(commit) = commit {
        checkout_commit(codebase, &repo, commit)?;
    }

    let head = repo.head().ok().and_then(|h| h.target()).map(|oid| oid.to_string());
    Ok(head)
}

/// Check out `commit`, fetching all refs once if the first attempt fails.
fn checkout_commit(codebase: &str, repo: &Repository, commit: &str) -> Result<()> {
    if try_checkout(repo, commit).is_ok() {
        return Ok(());
    }

    debug!(commit = %commit, "Initial checkout failed, fetching all refs");
    let mut remote = repo.find_remote("origin").map_err(|e| KilnError::FetchFailed {
        codebase: codebase.to_string(),
        kind: FetchErrorKind::Transport,
        reason: format!("no origin remote after clone: {}", e),
    })?;
    let mut fetch_options = FetchOptions::new();
    remote
        .fetch(
            &["+refs/heads/*:refs/remotes/origin/*", "+refs/tags/*:refs/tags/*"],
            Some(&mut fetch_options),
            None,
        )
        .map_err(|e| KilnError::FetchFailed {
            codebase: codebase.to_string(),
            kind: FetchErrorKind::Transport,
            reason: format!("fetch for commit '{}' failed: {}", commit, e),
        })?;

    try_checkout(repo, commit).map_err(|e| KilnError::FetchFailed {
        codebase: codebase.to_string(),
        kind: FetchErrorKind::NotFound,
        reason: format!("cannot check out commit '{}' (after fetch): {}", commit, e),
    })
}

fn try_checkout(repo: &Repository, commit: &str) -> std::result::Result<(), git2::Error> {
    let object = repo.revparse_single(commit)?;
    let commit_obj = object.peel(git2::ObjectType::Commit)?;
    repo.checkout_tree(&commit_obj, Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(commit_obj.id())
}

/// Map libgit2 errors onto the fetch error kinds clients can act on.
fn classify_git_error(codebase: &str, url: &str, err: git2::Error) -> KilnError {
    let kind = if err.code() == ErrorCode::Auth
        || err.class() == ErrorClass::Ssh
        || err.message().to_ascii_lowercase().contains("authentication")
        || err.message().contains("401")
    {
        FetchErrorKind::Auth
    } else if err.code() == ErrorCode::NotFound || err.message().contains("404") {
        FetchErrorKind::NotFound
    } else {
        FetchErrorKind::Transport
    };

    KilnError::FetchFailed {
        codebase: codebase.to_string(),
        kind,
        reason: format!("cloning '{}' failed: {}", url, err.message()),
    }
}
