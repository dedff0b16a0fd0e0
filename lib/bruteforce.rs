//! Brute-forcing the remaining keyspace against the real binary.

use crate::error::*;
use itertools::Itertools;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const PROGRESS_INTERVAL: u64 = 0x1000;

/// Every guess made by taking one candidate from each set, in order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct KeySpace {
    sets: Vec<Vec<Vec<u8>>>,
}

impl KeySpace {
    pub fn new(sets: Vec<Vec<Vec<u8>>>) -> KeySpace {
        KeySpace { sets }
    }

    /// The number of guesses. 65536^4 does not fit in a u64.
    pub fn len(&self) -> u128 {
        if self.sets.is_empty() {
            return 0;
        }
        self.sets.iter().map(|set| set.len() as u128).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn first(&self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        Some(self.sets.iter().flat_map(|set| set[0].iter().cloned()).collect())
    }

    /// Guesses in order, with the first set varying slowest.
    pub fn iter(&self) -> Box<dyn Iterator<Item = Vec<u8>> + Send + '_> {
        if self.is_empty() {
            return Box::new(std::iter::empty());
        }
        Box::new(
            self.sets
                .iter()
                .map(|set| set.iter())
                .multi_cartesian_product()
                .map(|parts| parts.into_iter().flatten().cloned().collect::<Vec<u8>>()),
        )
    }
}

/// Pull the flag out of the target's output.
///
/// Without the marker there is no flag. Otherwise the flag is the first
/// whitespace separated token holding the guess, falling back to the token
/// following the marker.
pub fn extract_flag(output: &str, marker: &str, guess: &str) -> Option<String> {
    let position = output.find(marker)?;

    if !guess.is_empty() {
        if let Some(token) = output.split_whitespace().find(|token| token.contains(guess)) {
            return Some(token.to_string());
        }
    }

    output[position + marker.len()..]
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}

/// Runs the target with a guess as its last argument.
#[derive(Clone, Debug)]
pub struct Runner {
    program: PathBuf,
    arguments: Vec<String>,
    marker: String,
}

impl Runner {
    /// A bare file name is run out of the current directory.
    pub fn new<P: AsRef<Path>, S: Into<String>>(program: P, marker: S) -> Runner {
        let program = program.as_ref();
        let program = if program.is_relative() && program.components().count() == 1 {
            Path::new(".").join(program)
        } else {
            program.to_path_buf()
        };

        Runner {
            program,
            arguments: Vec::new(),
            marker: marker.into(),
        }
    }

    /// Add an argument to pass ahead of the guess.
    pub fn arg<S: Into<String>>(mut self, argument: S) -> Runner {
        self.arguments.push(argument.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the program once. Stdout and stderr are searched together.
    pub fn try_guess(&self, guess: &[u8]) -> Result<Option<String>> {
        let guess = String::from_utf8(guess.to_vec())?;

        let output = Command::new(&self.program)
            .args(&self.arguments)
            .arg(&guess)
            .output()
            .chain_err(|| format!("Failed to run {}", self.program.display()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let flag = extract_flag(&combined, &self.marker, &guess);
        if flag.is_some() {
            debug!("{} printed {:?}", guess, combined);
        }
        Ok(flag)
    }
}

struct Progress {
    total: u128,
    count: AtomicU64,
    started: Instant,
}

impl Progress {
    fn new(total: u128) -> Progress {
        Progress {
            total,
            count: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn tick(&self) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % PROGRESS_INTERVAL != 0 && count as u128 != self.total {
            return;
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        let remaining = self.total.saturating_sub(count as u128) as f64;
        let eta = elapsed / count as f64 * remaining;

        info!(
            "{}/{} {:.2}% ETA {:.0}s",
            count,
            self.total,
            count as f64 * 100.0 / self.total as f64,
            eta
        );
    }
}

/// Try every guess in the keyspace, stopping at the first one which gets the
/// marker out of the target.
///
/// With one job, guesses run one at a time in keyspace order. With more, a
/// pool of `jobs` threads runs them, and whichever success comes first wins.
pub fn brute_force(keyspace: &KeySpace, runner: &Runner, jobs: usize) -> Result<Option<String>> {
    let progress = Progress::new(keyspace.len());

    if jobs <= 1 {
        for guess in keyspace.iter() {
            progress.tick();
            if let Some(flag) = runner.try_guess(&guess)? {
                return Ok(Some(flag));
            }
        }
        return Ok(None);
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;

    pool.install(|| {
        keyspace
            .iter()
            .par_bridge()
            .map(|guess| {
                progress.tick();
                runner.try_guess(&guess)
            })
            .find_map_any(|result| match result {
                Ok(Some(flag)) => Some(Ok(flag)),
                Ok(None) => None,
                Err(error) => Some(Err(error)),
            })
            .transpose()
    })
}
