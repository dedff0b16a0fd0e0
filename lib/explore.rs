//! Find/avoid exploration over a group of paths.
//!
//! A `PathGroup` keeps its paths in stashes. Each call to `explore` steps
//! every active path once per round, and bins the successors: paths on the
//! find address go to `found`, paths on an avoid address go to `avoided`, and
//! everything else stays active. Exploration stops as soon as something has
//! been found.

use crate::error::*;

const PROGRESS_INTERVAL: usize = 0x100;

/// Anything which can be explored. The address is the native address of the
/// instruction the path is about to execute, if it sits on an instruction.
pub trait Path: Sized {
    fn address(&self) -> Option<u64>;
}

/// Advances a path by one step, returning its successors.
pub trait Step<P: Path> {
    fn step(&self, path: P) -> Result<Vec<P>>;
}

impl<P, F> Step<P> for F
where
    P: Path,
    F: Fn(P) -> Result<Vec<P>>,
{
    fn step(&self, path: P) -> Result<Vec<P>> {
        self(path)
    }
}

/// Where an exploration should go, and where it must not.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Goal {
    find: u64,
    avoid: Vec<u64>,
}

impl Goal {
    pub fn new(find: u64) -> Goal {
        Goal {
            find,
            avoid: Vec::new(),
        }
    }

    pub fn avoid(mut self, avoid: &[u64]) -> Goal {
        self.avoid.extend_from_slice(avoid);
        self
    }

    pub fn find_address(&self) -> u64 {
        self.find
    }

    pub fn avoid_addresses(&self) -> &[u64] {
        &self.avoid
    }
}

/// A path which failed to step, along with the reason.
#[derive(Debug)]
pub struct Errored {
    pub address: Option<u64>,
    pub error: Error,
}

pub struct PathGroup<P: Path> {
    active: Vec<P>,
    found: Vec<P>,
    avoided: Vec<P>,
    deadended: usize,
    errored: Vec<Errored>,
    culled: usize,
    max_active: Option<usize>,
    steps: usize,
}

impl<P: Path> PathGroup<P> {
    pub fn new(paths: Vec<P>) -> PathGroup<P> {
        PathGroup {
            active: paths,
            found: Vec::new(),
            avoided: Vec::new(),
            deadended: 0,
            errored: Vec::new(),
            culled: 0,
            max_active: None,
            steps: 0,
        }
    }

    /// Bound the number of active paths. When a round leaves more than this
    /// many paths active, the oldest are dropped.
    pub fn with_max_active(mut self, max_active: Option<usize>) -> PathGroup<P> {
        self.max_active = max_active;
        self
    }

    pub fn active(&self) -> &[P] {
        &self.active
    }

    pub fn found(&self) -> &[P] {
        &self.found
    }

    pub fn avoided(&self) -> &[P] {
        &self.avoided
    }

    pub fn errored(&self) -> &[Errored] {
        &self.errored
    }

    /// Number of paths which ran out of successors
    pub fn deadended(&self) -> usize {
        self.deadended
    }

    /// Number of paths dropped to keep under `max_active`
    pub fn culled(&self) -> usize {
        self.culled
    }

    /// Total rounds stepped over the lifetime of this group
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Take the found paths out of this group.
    pub fn take_found(&mut self) -> Vec<P> {
        std::mem::replace(&mut self.found, Vec::new())
    }

    /// Move all found paths back into the active stash.
    pub fn unstash_found(&mut self) -> &mut PathGroup<P> {
        self.active.append(&mut self.found);
        self
    }

    /// Step active paths until one reaches the goal, no paths are left
    /// active, or `max_steps` rounds have been taken.
    pub fn explore<S: Step<P>>(
        &mut self,
        stepper: &S,
        goal: &Goal,
        max_steps: usize,
    ) -> &mut PathGroup<P> {
        for step in 0..max_steps {
            if !self.found.is_empty() || self.active.is_empty() {
                break;
            }

            if step % PROGRESS_INTERVAL == 0 {
                info!(
                    "explore find=0x{:x} step={} active={} found={} avoided={} errored={}",
                    goal.find,
                    step,
                    self.active.len(),
                    self.found.len(),
                    self.avoided.len(),
                    self.errored.len()
                );
            }

            let active = std::mem::replace(&mut self.active, Vec::new());
            for path in active {
                let address = path.address();
                let successors = match stepper.step(path) {
                    Ok(successors) => successors,
                    Err(error) => {
                        warn!(
                            "Path at {} errored: {}",
                            address
                                .map(|a| format!("0x{:x}", a))
                                .unwrap_or_else(|| "?".to_string()),
                            error
                        );
                        self.errored.push(Errored { address, error });
                        continue;
                    }
                };

                if successors.is_empty() {
                    self.deadended += 1;
                    continue;
                }

                for successor in successors {
                    match successor.address() {
                        Some(address) if address == goal.find => {
                            debug!("Path found 0x{:x}", address);
                            self.found.push(successor);
                        }
                        Some(address) if goal.avoid.contains(&address) => {
                            trace!("Path avoided 0x{:x}", address);
                            self.avoided.push(successor);
                        }
                        _ => self.active.push(successor),
                    }
                }
            }

            self.steps += 1;

            if let Some(max_active) = self.max_active {
                if self.active.len() > max_active {
                    let excess = self.active.len() - max_active;
                    warn!(
                        "{} active paths is {} more than max of {}, culling the oldest",
                        self.active.len(),
                        excess,
                        max_active
                    );
                    self.active.drain(0..excess);
                    self.culled += excess;
                }
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Clone, Debug, PartialEq)]
    struct Walker {
        address: u64,
    }

    impl Path for Walker {
        fn address(&self) -> Option<u64> {
            Some(self.address)
        }
    }

    fn graph(edges: &[(u64, &[u64])]) -> HashMap<u64, Vec<u64>> {
        edges
            .iter()
            .map(|(from, to)| (*from, to.to_vec()))
            .collect()
    }

    fn walker_step(graph: &HashMap<u64, Vec<u64>>) -> impl Fn(Walker) -> Result<Vec<Walker>> + '_ {
        move |walker: Walker| {
            if walker.address == 0xdead {
                bail!("unmodelled instruction");
            }
            Ok(graph
                .get(&walker.address)
                .map(|successors| {
                    successors
                        .iter()
                        .map(|address| Walker { address: *address })
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    #[test]
    fn finds_target() {
        let graph = graph(&[(0, &[1]), (1, &[2, 3]), (2, &[4]), (3, &[5])]);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]);
        group.explore(&walker_step(&graph), &Goal::new(5), 100);

        assert_eq!(group.found(), &[Walker { address: 5 }]);
        // 2 -> 4 ran in the same round as 3 -> 5
        assert_eq!(group.active(), &[Walker { address: 4 }]);
        assert_eq!(group.steps(), 3);
    }

    #[test]
    fn avoided_paths_are_not_stepped() {
        let graph = graph(&[(0, &[1, 2]), (1, &[3]), (2, &[3])]);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]);
        group.explore(&walker_step(&graph), &Goal::new(3).avoid(&[2]), 100);

        assert_eq!(group.found().len(), 1);
        assert_eq!(group.avoided(), &[Walker { address: 2 }]);
    }

    #[test]
    fn errors_and_dead_ends_are_stashed() {
        let graph = graph(&[(0, &[0xdead, 7, 1]), (1, &[2])]);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]);
        group.explore(&walker_step(&graph), &Goal::new(2), 100);

        assert_eq!(group.found(), &[Walker { address: 2 }]);
        assert_eq!(group.errored().len(), 1);
        assert_eq!(group.errored()[0].address, Some(0xdead));
        assert_eq!(group.deadended(), 1);
    }

    #[test]
    fn stops_when_out_of_steps() {
        let graph = graph(&[(0, &[1]), (1, &[0])]);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]);
        group.explore(&walker_step(&graph), &Goal::new(9), 10);

        assert!(group.found().is_empty());
        assert_eq!(group.active().len(), 1);
        assert_eq!(group.steps(), 10);
    }

    #[test]
    fn stops_when_nothing_is_active() {
        let graph = graph(&[(0, &[1])]);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]);
        group.explore(&walker_step(&graph), &Goal::new(9), 1000);

        assert!(group.found().is_empty());
        assert!(group.active().is_empty());
        assert_eq!(group.steps(), 2);
        assert_eq!(group.deadended(), 1);
    }

    #[test]
    fn stages_chain_through_unstash() {
        let graph = graph(&[
            (0, &[1]),
            (1, &[2, 10]),
            (2, &[3, 11]),
            (3, &[4]),
            (10, &[3]),
            (11, &[4]),
        ]);
        let step = walker_step(&graph);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]);

        group.explore(&step, &Goal::new(1), 100).unstash_found();
        group
            .explore(&step, &Goal::new(2).avoid(&[10]), 100)
            .unstash_found();
        group.explore(&step, &Goal::new(4).avoid(&[11]), 100);

        assert_eq!(group.found(), &[Walker { address: 4 }]);
        assert_eq!(group.avoided().len(), 2);
        assert_eq!(group.take_found().len(), 1);
        assert!(group.found().is_empty());
    }

    #[test]
    fn culls_oldest_active_paths() {
        let graph = graph(&[(0, &[1, 2, 3, 4]), (1, &[1]), (2, &[2]), (3, &[3]), (4, &[4])]);
        let mut group = PathGroup::new(vec![Walker { address: 0 }]).with_max_active(Some(2));
        group.explore(&walker_step(&graph), &Goal::new(9), 1);

        assert_eq!(
            group.active(),
            &[Walker { address: 3 }, Walker { address: 4 }]
        );
        assert_eq!(group.culled(), 2);
    }
}
