mod dump;
mod index;
mod r#match;

pub use dump::*;
pub use index::*;
pub use r#match::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
