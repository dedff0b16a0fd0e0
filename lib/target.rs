//! The fixed facts about the crackme, recovered by hand from the binary.

use crate::explore::Goal;
use crate::hooks::{Hook, Hooks};
use crate::summaries::{self, Summary};

/// What gets installed at a hooked address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HookSpec {
    Summary(Summary),
    /// Replace `length` bytes of code with `register = value`.
    SetRegister {
        register: &'static str,
        value: u64,
        length: u64,
    },
}

impl HookSpec {
    pub fn hook(&self) -> Hook {
        match *self {
            HookSpec::Summary(summary) => summary.hook(),
            HookSpec::SetRegister {
                register,
                value,
                length,
            } => Hook::inline(
                format!("{} = {}", register, value),
                length,
                summaries::set_register(register, value),
            ),
        }
    }
}

/// Everything the solver needs to know about one binary.
#[derive(Clone, Debug)]
pub struct Target {
    /// `argv[0]` handed to the symbolic process
    pub name: &'static str,
    pub hooks: Vec<(u64, HookSpec)>,
    /// Exploration stages, run in order
    pub stages: Vec<Goal>,
    /// Where the passphrase lands once copied out of `argv[1]`
    pub key_address: u64,
    pub key_length: usize,
    /// Bytes enumerated together
    pub chunk: usize,
    /// Printed by the binary when the passphrase is right
    pub marker: &'static str,
}

impl Target {
    /// WhitehatCTF 2015, crypto400.
    pub fn whitehat_crypto400() -> Target {
        const AVOID: [u64; 3] = [0x40_17d6, 0x40_1699, 0x40_167d];

        Target {
            name: "crypto400",
            hooks: vec![
                (0x40_18b0, HookSpec::Summary(Summary::LibcStartMain)),
                (0x42_2690, HookSpec::Summary(Summary::Memcpy)),
                (0x40_8f10, HookSpec::Summary(Summary::Puts)),
                // ptrace based anti-debugging
                (0x40_1438, HookSpec::Summary(Summary::ReturnUnconstrained)),
                // strlen(argv[1]) call sites
                (
                    0x40_168e,
                    HookSpec::SetRegister {
                        register: "rax",
                        value: 8,
                        length: 5,
                    },
                ),
                (
                    0x40_16be,
                    HookSpec::SetRegister {
                        register: "rax",
                        value: 8,
                        length: 5,
                    },
                ),
            ],
            stages: vec![
                Goal::new(0x40_16a3),
                Goal::new(0x40_16b7).avoid(&AVOID),
                Goal::new(0x40_17cf).avoid(&AVOID),
                Goal::new(0x40_1825).avoid(&[0x40_1811]),
            ],
            key_address: 0x6c_4b20,
            key_length: 8,
            chunk: 2,
            marker: "FLAG IS",
        }
    }

    pub fn hooks(&self) -> Hooks {
        let mut hooks = Hooks::new();
        for (address, spec) in &self.hooks {
            hooks.add_hook(*address, spec.hook());
        }
        hooks
    }

    /// Every code address this target refers to.
    pub fn addresses(&self) -> Vec<u64> {
        let mut addresses = self
            .hooks
            .iter()
            .map(|(address, _)| *address)
            .collect::<Vec<u64>>();
        for stage in &self.stages {
            addresses.push(stage.find_address());
            addresses.extend_from_slice(stage.avoid_addresses());
        }
        addresses.sort();
        addresses.dedup();
        addresses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto400_stages() {
        let target = Target::whitehat_crypto400();
        let finds = target
            .stages
            .iter()
            .map(|stage| stage.find_address())
            .collect::<Vec<u64>>();
        assert_eq!(finds, vec![0x40_16a3, 0x40_16b7, 0x40_17cf, 0x40_1825]);
        assert!(target.stages[0].avoid_addresses().is_empty());
        assert_eq!(
            target.stages[1].avoid_addresses(),
            &[0x40_17d6, 0x40_1699, 0x40_167d]
        );
        assert_eq!(target.stages[1].avoid_addresses(), target.stages[2].avoid_addresses());
        assert_eq!(target.stages[3].avoid_addresses(), &[0x40_1811]);
    }

    #[test]
    fn crypto400_hooks() {
        let target = Target::whitehat_crypto400();
        let hooks = target.hooks();
        assert_eq!(hooks.len(), 6);
        assert_eq!(hooks.get(0x40_18b0).unwrap().name(), "__libc_start_main");
        assert!(hooks.get(0x40_1438).unwrap().is_function());
        assert_eq!(hooks.get(0x40_168e).unwrap().length(), Some(5));
        assert_eq!(hooks.get(0x40_16be).unwrap().length(), Some(5));
    }

    #[test]
    fn addresses_are_unique_and_sorted() {
        let addresses = Target::whitehat_crypto400().addresses();
        assert_eq!(addresses.len(), 14);
        assert!(addresses.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
