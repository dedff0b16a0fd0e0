//! The whole solve, from loading the binary to printing the flag.

use crate::bruteforce::{self, KeySpace, Runner};
use crate::error::*;
use crate::explore::PathGroup;
use crate::loader::{Argument, Project};
use crate::solver;
use crate::stepper::Stepper;
use crate::target::Target;
use std::path::PathBuf;

/// Knobs for a solve. `Config::default()` solves the stock challenge from the
/// current directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub binary: PathBuf,
    /// Rounds each exploration stage may take
    pub max_steps: usize,
    /// Most candidates enumerated for one window of the key
    pub limit: usize,
    /// Processes run at once while brute-forcing
    pub jobs: usize,
    pub max_active: Option<usize>,
    pub bypass_unsupported_syscalls: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            binary: PathBuf::from("whitehat_crypto400"),
            max_steps: 100_000,
            limit: 65536,
            jobs: 1,
            max_active: None,
            bypass_unsupported_syscalls: true,
        }
    }
}

/// Drive the target through every stage, and enumerate the windows of the
/// key on the first path to make it.
pub fn candidates(config: &Config, target: &Target) -> Result<Vec<Vec<Vec<u8>>>> {
    println!("[*] loading the binary");
    let project = Project::load(&config.binary)?;
    project.verify(&target.addresses())?;

    let stepper = Stepper::new(
        target.hooks(),
        project.lifter(),
        config.bypass_unsupported_syscalls,
    );

    let driver = project.entry_state(&[
        Argument::concrete(target.name),
        Argument::symbolic("argv1", target.key_length),
    ])?;

    println!("[*] executing");
    let mut group = PathGroup::new(vec![driver]).with_max_active(config.max_active);

    for (i, goal) in target.stages.iter().enumerate() {
        if i > 0 {
            group.unstash_found();
        }

        group.explore(&stepper, goal, config.max_steps);

        debug!(
            "Stage {} 0x{:x}: active={} found={} avoided={} errored={} deadended={}",
            i,
            goal.find_address(),
            group.active().len(),
            group.found().len(),
            group.avoided().len(),
            group.errored().len(),
            group.deadended()
        );

        if group.found().is_empty() {
            for errored in group.errored() {
                debug!("errored at {:?}: {}", errored.address, errored.error);
            }
            bail!(ErrorKind::NoPathFound(goal.find_address()));
        }
    }

    if stepper.syscalls_bypassed() > 0 {
        debug!("{} syscalls bypassed", stepper.syscalls_bypassed());
    }

    let mut driver = group
        .take_found()
        .into_iter()
        .next()
        .ok_or_else(|| ErrorKind::NoPathFound(target.key_address))?;
    let state = driver.state_mut();

    solver::constrain_printable(state, target.key_address, target.key_length)?;
    solver::byte_pair_candidates(
        state,
        target.key_address,
        target.key_length,
        target.chunk,
        config.limit,
    )
}

/// Solve the target. `None` means no candidate got the marker out of it.
pub fn solve(config: &Config, target: &Target) -> Result<Option<String>> {
    let keyspace = KeySpace::new(candidates(config, target)?);

    let first = match keyspace.first() {
        Some(first) => first,
        None => {
            warn!("No candidates to try");
            return Ok(None);
        }
    };

    println!(
        "[*] example guess: {:?}",
        String::from_utf8_lossy(&first)
    );
    println!("[*] brute-forcing {} possibilities", keyspace.len());

    let runner = Runner::new(&config.binary, target.marker);
    bruteforce::brute_force(&keyspace, &runner, config.jobs)
}
