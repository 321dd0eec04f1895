// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::process;

use crate::Result;
use clap::{Parser, Subcommand};
use strata_storage::ErrorCode;
use tracing::debug;

mod inspect;
mod perf;
mod retain;

const DEFAULT_PATH: &str = "./data";

#[derive(Clone, Debug, Parser)]
#[command(name = "strata", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Describe the partition groups of a store
    Inspect(Box<inspect::Arg>),

    /// Load generator producing into and consuming from a local store
    Perf(Box<perf::Arg>),

    /// Purge segments no longer retained by a size or age limit
    Retain(Box<retain::Arg>),
}

impl Cli {
    pub async fn main() -> Result<ErrorCode> {
        debug!(pid = process::id());

        let cli = Cli::parse();

        match cli.command {
            Command::Inspect(arg) => arg
                .main()
                .await
                .inspect(|result| debug!(?result))
                .inspect_err(|err| debug!(?err)),

            Command::Perf(arg) => arg
                .main()
                .await
                .inspect(|result| debug!(?result))
                .inspect_err(|err| debug!(?err)),

            Command::Retain(arg) => arg
                .main()
                .await
                .inspect(|result| debug!(?result))
                .inspect_err(|err| debug!(?err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn perf_defaults() -> Result<()> {
        let cli = Cli::try_parse_from(["strata", "perf", "orders"])
            .map_err(|error| strata_storage::Error::Message(error.to_string()))?;

        assert!(matches!(cli.command, Command::Perf(_)));
        Ok(())
    }

    #[test]
    fn retain_requires_a_limit() {
        assert!(Cli::try_parse_from(["strata", "retain", "orders"]).is_err());
        assert!(
            Cli::try_parse_from(["strata", "retain", "orders", "--max-age", "7days"]).is_ok()
        );
    }
}
