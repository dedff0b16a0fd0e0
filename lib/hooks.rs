use crate::error::*;
use crate::machine::{self, Lifter};
use finch::executor::{Driver, State};
use std::collections::HashMap;

/// Where a driver picks back up after a hook has run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Pop a return address off the stack and continue there.
    Return,
    /// Continue at the hooked address plus the hook's length.
    Skip,
    /// Continue at the given address.
    Jump(u64),
    /// The path ends here.
    Halt,
}

/// A substitute for the code at an address.
///
/// A hook without a length summarizes a whole function, and is applied both
/// when a driver lands on the function and when a driver is about to branch
/// into it. A hook with a length replaces that many bytes of code.
pub struct Hook {
    name: String,
    length: Option<u64>,
    summary: Box<dyn Fn(&mut State) -> Result<Resume>>,
}

impl Hook {
    pub fn function<S, F: 'static>(name: S, summary: F) -> Hook
    where
        S: Into<String>,
        F: Fn(&mut State) -> Result<Resume>,
    {
        Hook {
            name: name.into(),
            length: None,
            summary: Box::new(summary),
        }
    }

    pub fn inline<S, F: 'static>(name: S, length: u64, summary: F) -> Hook
    where
        S: Into<String>,
        F: Fn(&mut State) -> Result<Resume>,
    {
        Hook {
            name: name.into(),
            length: Some(length),
            summary: Box::new(summary),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn is_function(&self) -> bool {
        self.length.is_none()
    }

    pub fn process(&self, state: &mut State) -> Result<Resume> {
        (self.summary)(state)
    }
}

pub struct Hooks {
    hooks: HashMap<u64, Hook>,
}

impl Hooks {
    pub fn new() -> Hooks {
        Hooks {
            hooks: HashMap::new(),
        }
    }

    pub fn add_hook(&mut self, address: u64, hook: Hook) {
        if let Some(previous) = self.hooks.insert(address, hook) {
            warn!("Replaced hook {} at 0x{:x}", previous.name(), address);
        }
    }

    pub fn get(&self, address: u64) -> Option<&Hook> {
        self.hooks.get(&address)
    }

    pub fn addresses(&self) -> Vec<u64> {
        let mut addresses = self.hooks.keys().cloned().collect::<Vec<u64>>();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the hook at `address` over the driver, and move the driver to
    /// wherever the hook resumes.
    pub fn process(&self, lifter: &Lifter, mut driver: Driver, address: u64) -> Result<Vec<Driver>> {
        let hook = self
            .get(address)
            .ok_or_else(|| format!("No hook at 0x{:x}", address))?;

        trace!("Hook {} at 0x{:x}", hook.name(), address);

        let resume = hook.process(driver.state_mut())?;

        let target = match resume {
            Resume::Return => machine::pop(driver.state_mut())?,
            Resume::Skip => match hook.length() {
                Some(length) => address + length,
                None => bail!("Function hook {} can not skip", hook.name()),
            },
            Resume::Jump(target) => target,
            Resume::Halt => return Ok(Vec::new()),
        };

        Ok(vec![lifter.jump(driver, target)?])
    }
}

impl Default for Hooks {
    fn default() -> Hooks {
        Hooks::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::tests::blank_state;
    use falcon::il;

    #[test]
    fn hooks_run_their_summary() {
        let mut hooks = Hooks::new();
        hooks.add_hook(
            0x40_168e,
            Hook::inline("strlen", 5, |state| {
                machine::set_return(state, &il::expr_const(8, 64))?;
                Ok(Resume::Skip)
            }),
        );
        hooks.add_hook(0x40_8f10, Hook::function("halt", |_| Ok(Resume::Halt)));

        assert_eq!(hooks.addresses(), vec![0x40_168e, 0x40_8f10]);
        assert!(hooks.get(0x40_8f10).unwrap().is_function());
        assert_eq!(hooks.get(0x40_168e).unwrap().length(), Some(5));
        assert!(hooks.get(0x40_1000).is_none());

        let mut state = blank_state();
        let resume = hooks.get(0x40_168e).unwrap().process(&mut state).unwrap();
        assert_eq!(resume, Resume::Skip);
        assert_eq!(machine::register(&mut state, "rax").unwrap(), 8);
    }

    #[test]
    fn adding_twice_replaces() {
        let mut hooks = Hooks::default();
        hooks.add_hook(0x1000, Hook::function("first", |_| Ok(Resume::Return)));
        hooks.add_hook(0x1000, Hook::function("second", |_| Ok(Resume::Halt)));
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks.get(0x1000).unwrap().name(), "second");
    }
}
