pub mod config;
pub mod content_match;
pub mod detect;
pub mod filesystem;
pub mod fix;
pub mod frontmatter;
pub mod heal;
pub mod invariants;
pub mod links;
pub mod lint;
pub mod rename;
pub mod rewrite;
pub mod runtime;
pub mod safety;
pub mod store;
pub mod vcs;
