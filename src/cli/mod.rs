mod extract;
mod search;
mod worker;

pub use extract::*;
pub use search::*;
pub use worker::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
