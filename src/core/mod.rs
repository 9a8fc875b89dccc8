#![forbid(unsafe_code)]

pub mod git;
pub mod worktree;
