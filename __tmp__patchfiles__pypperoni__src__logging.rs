// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::Drain;

/// A slog Drain that uses println!.
pub struct PrintlnDrain {
    /// Minimum logging level that we're emitting.
    pub min_level: slog::Level,
}

/// slog Drain that uses println!.
impl slog::Drain for PrintlnDrain {
    type Ok = ();
    type Err = std::io::Error;

    fn log(
        &self,
        record: &slog::Record,
        _values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.min_level) {
            println!("{}", record.msg());
        }

        Ok(())
    }
}

/// Context holding state for a logger.
pub struct LoggerContext {
    pub logger: slog::Logger,
}

/// Construct a slog::Logger from settings in environment.
pub fn logger_from_env(min_level: slog::Level) -> LoggerContext {
    LoggerContext {
        logger: slog::Logger::root(PrintlnDrain { min_level }.fuse(), slog::o!()),
    }
}

impl Default for LoggerContext {
    fn default() -> Self {
        LoggerContext {
            logger: slog::Logger::root(
                PrintlnDrain {
                    min_level: slog::Level::Warning,
                }
                .fuse(),
                slog::o!(),
            ),
        }
    }
}

/// Map a `-v`/`-q` count pair onto a minimum slog level, starting from
/// `Info` (the CLI's default) and moving one level per flag.
pub fn level_from_verbosity(verbose: u8, quiet: u8) -> slog::Level {
    const LEVELS: &[slog::Level] = &[
        slog::Level::Critical,
        slog::Level::Error,
        slog::Level::Warning,
        slog::Level::Info,
        slog::Level::Debug,
        slog::Level::Trace,
    ];
    let base = 3i32; // Info
    let idx = (base + verbose as i32 - quiet as i32).clamp(0, LEVELS.len() as i32 - 1);
    LEVELS[idx as usize]
}

/// Adapts the orchestrator's `ProgressReporter` trait onto an slog logger,
/// so library callers that don't want CLI-flavored output can supply their
/// own implementation instead.
pub struct SlogProgressReporter {
    pub logger: slog::Logger,
}

impl pypperoni_packaging::orchestrator::ProgressReporter for SlogProgressReporter {
    fn module_started(&self, index: usize, total: usize, name: &str) {
        slog::info!(self.logger, "[{}/{}] {}", index + 1, total, name);
    }

    fn warn(&self, message: &str) {
        slog::warn!(self.logger, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_verbosity_is_info() {
        assert_eq!(level_from_verbosity(0, 0), slog::Level::Info);
    }

    #[test]
    fn test_verbose_raises_detail() {
        assert_eq!(level_from_verbosity(2, 0), slog::Level::Trace);
    }

    #[test]
    fn test_quiet_lowers_detail() {
        assert_eq!(level_from_verbosity(0, 3), slog::Level::Critical);
    }
}


