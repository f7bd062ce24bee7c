//! Long-running CLI commands.

mod collect;

pub use collect::{collect_aws, collect_sources, print_summary, SourceSelection};
