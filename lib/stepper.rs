//! Single-stepping finch drivers with hooks and syscall bypass layered on top.

use crate::error::*;
use crate::explore::{Path, Step};
use crate::hooks::Hooks;
use crate::machine::{self, Lifter};
use falcon::il;
use finch::executor::Driver;
use std::cell::Cell;

const SYSCALL_EXIT: u64 = 60;
const SYSCALL_EXIT_GROUP: u64 = 231;

impl Path for Driver {
    fn address(&self) -> Option<u64> {
        Driver::address(self)
    }
}

/// Steps drivers over the target.
///
/// Before handing a driver to finch, the stepper checks whether the driver
/// sits on a hooked address, or is about to branch into a hooked function,
/// and runs the hook in place of the code. When `bypass_unsupported_syscalls`
/// is set, `exit` and `exit_group` end the path, and every other `syscall` is
/// skipped with `rax` receiving a fresh symbolic value.
pub struct Stepper {
    hooks: Hooks,
    lifter: Lifter,
    bypass_unsupported_syscalls: bool,
    syscalls: Cell<usize>,
}

impl Stepper {
    pub fn new(hooks: Hooks, lifter: Lifter, bypass_unsupported_syscalls: bool) -> Stepper {
        Stepper {
            hooks,
            lifter,
            bypass_unsupported_syscalls,
            syscalls: Cell::new(0),
        }
    }

    /// Number of syscalls bypassed so far
    pub fn syscalls_bypassed(&self) -> usize {
        self.syscalls.get()
    }

    /// The hooked function this driver is about to branch into, if any.
    fn branch_hook(&self, driver: &Driver) -> Result<Option<u64>> {
        let instruction = match driver.instruction() {
            Some(instruction) => instruction,
            None => return Ok(None),
        };

        let target = match instruction.operation() {
            il::Operation::Branch { target } => target,
            _ => return Ok(None),
        };

        let target = match driver.state().symbolize_and_eval(target)? {
            Some(target) => target,
            None => return Ok(None),
        };

        Ok(target.value_u64().filter(|target| {
            self.hooks
                .get(*target)
                .map(|hook| hook.is_function())
                .unwrap_or(false)
        }))
    }

    fn is_syscall(driver: &Driver) -> bool {
        match driver.instruction() {
            Some(instruction) => match instruction.operation() {
                il::Operation::Intrinsic { intrinsic } => intrinsic.mnemonic() == "syscall",
                _ => false,
            },
            None => false,
        }
    }

    fn bypass_syscall(&self, mut driver: Driver) -> Result<Vec<Driver>> {
        let address = driver.address().unwrap_or(0);

        // A symbolic syscall number is bypassed like any other
        let number = driver
            .state()
            .symbolize_expression(&il::expr_scalar("rax", 64))?;
        if number.all_constants() {
            match falcon::executor::eval(&number)?.value_u64() {
                Some(SYSCALL_EXIT) | Some(SYSCALL_EXIT_GROUP) => {
                    debug!("Process exits at 0x{:x}", address);
                    return Ok(Vec::new());
                }
                _ => {}
            }
        }

        let n = self.syscalls.get();
        self.syscalls.set(n + 1);

        debug!("Bypassing syscall at 0x{:x}", address);

        let location: il::ProgramLocation = {
            let locations = driver.ref_program_location().forward()?;
            if locations.len() != 1 {
                bail!(
                    "syscall at 0x{:x} has {} successors, expected 1",
                    address,
                    locations.len()
                );
            }
            locations[0].clone().into()
        };

        machine::set_return(
            driver.state_mut(),
            &il::expr_scalar(format!("syscall_{}", n), 64),
        )?;
        driver.set_location(location);

        Ok(vec![driver])
    }
}

impl Step<Driver> for Stepper {
    fn step(&self, driver: Driver) -> Result<Vec<Driver>> {
        if let Some(address) = driver.address() {
            if driver.instruction().is_some() && self.hooks.get(address).is_some() {
                return self.hooks.process(&self.lifter, driver, address);
            }
        }

        if let Some(target) = self.branch_hook(&driver)? {
            return self.hooks.process(&self.lifter, driver, target);
        }

        if self.bypass_unsupported_syscalls && Stepper::is_syscall(&driver) {
            return self.bypass_syscall(driver);
        }

        Ok(driver.step()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Hook, Resume};
    use crate::machine::tests::{blank_state, STACK_POINTER};
    use falcon::architecture::{Amd64, Architecture};
    use falcon::memory::MemoryPermissions;
    use falcon::RC;
    use finch::executor::State;

    const FUNCTION: u64 = 0x40_1000;
    const HOOKED: u64 = 0x40_2000;

    fn store_code(state: &mut State, address: u64, code: &[u8]) {
        state
            .memory_mut()
            .set_permissions(
                address & !0xfff,
                0x1000,
                Some(MemoryPermissions::READ | MemoryPermissions::EXECUTE),
            )
            .unwrap();
        for (i, byte) in code.iter().enumerate() {
            state
                .memory_mut()
                .store(address + i as u64, &il::expr_const(*byte as u64, 8))
                .unwrap();
        }
    }

    fn lifter() -> Lifter {
        let architecture: Box<dyn Architecture> = Box::new(Amd64::new());
        Lifter::new(RC::new(architecture))
    }

    fn driver_at(state: State, address: u64) -> Driver {
        lifter().driver(state, address).unwrap()
    }

    fn run_until<S: Step<Driver>>(stepper: &S, driver: Driver, address: u64) -> Driver {
        let mut driver = driver;
        for _ in 0..0x100 {
            if driver.address() == Some(address) {
                return driver;
            }
            let mut successors = stepper.step(driver).unwrap();
            assert_eq!(successors.len(), 1);
            driver = successors.pop().unwrap();
        }
        panic!("never reached 0x{:x}", address);
    }

    #[test]
    fn calls_into_hooked_functions_return_through_the_summary() {
        let mut state = blank_state();
        // call 0x402000 ; xor ecx, ecx ; ret
        store_code(&mut state, FUNCTION, &[0xe8, 0xfb, 0x0f, 0x00, 0x00, 0x31, 0xc9, 0xc3]);

        let mut hooks = Hooks::new();
        hooks.add_hook(
            HOOKED,
            Hook::function("answer", |state| {
                machine::set_return(state, &il::expr_const(42, 64))?;
                Ok(Resume::Return)
            }),
        );
        let stepper = Stepper::new(hooks, lifter(), true);

        let driver = driver_at(state, FUNCTION);
        let mut driver = run_until(&stepper, driver, FUNCTION + 5);

        assert_eq!(machine::register(driver.state_mut(), "rax").unwrap(), 42);
        assert_eq!(
            machine::register(driver.state_mut(), "rsp").unwrap(),
            STACK_POINTER
        );
    }

    #[test]
    fn inline_hooks_skip_their_length() {
        let mut state = blank_state();
        // mov eax, 1 ; xor ecx, ecx ; ret
        store_code(&mut state, FUNCTION, &[0xb8, 0x01, 0x00, 0x00, 0x00, 0x31, 0xc9, 0xc3]);

        let mut hooks = Hooks::new();
        hooks.add_hook(
            FUNCTION,
            Hook::inline("mov eax, 8", 5, crate::summaries::set_register("rax", 8)),
        );
        let stepper = Stepper::new(hooks, lifter(), true);

        let driver = driver_at(state, FUNCTION);
        let mut successors = stepper.step(driver).unwrap();
        assert_eq!(successors.len(), 1);
        let mut driver = successors.pop().unwrap();

        assert_eq!(driver.address(), Some(FUNCTION + 5));
        assert_eq!(machine::register(driver.state_mut(), "rax").unwrap(), 8);
    }

    #[test]
    fn syscalls_are_bypassed() {
        let mut state = blank_state();
        // syscall ; xor ecx, ecx ; ret
        store_code(&mut state, FUNCTION, &[0x0f, 0x05, 0x31, 0xc9, 0xc3]);

        let stepper = Stepper::new(Hooks::new(), lifter(), true);
        let driver = driver_at(state, FUNCTION);
        let driver = run_until(&stepper, driver, FUNCTION + 2);

        assert_eq!(stepper.syscalls_bypassed(), 1);
        assert!(!driver.state().scalar("rax").unwrap().all_constants());
    }

    #[test]
    fn each_bypassed_syscall_is_counted() {
        let mut state = blank_state();
        // syscall ; syscall ; xor ecx, ecx ; ret
        store_code(&mut state, FUNCTION, &[0x0f, 0x05, 0x0f, 0x05, 0x31, 0xc9, 0xc3]);

        let stepper = Stepper::new(Hooks::new(), lifter(), true);
        let driver = driver_at(state, FUNCTION);
        let driver = run_until(&stepper, driver, FUNCTION + 2);
        let first = driver.state().scalar("rax").unwrap();
        let driver = run_until(&stepper, driver, FUNCTION + 4);

        assert_eq!(stepper.syscalls_bypassed(), 2);
        assert_ne!(first, driver.state().scalar("rax").unwrap());
    }

    #[test]
    fn exits_end_the_path() {
        // mov eax, 231 ; syscall ; xor ecx, ecx ; ret
        let exit_group = [0xb8, 0xe7, 0x00, 0x00, 0x00, 0x0f, 0x05, 0x31, 0xc9, 0xc3];
        // mov eax, 60 ; syscall ; xor ecx, ecx ; ret
        let exit = [0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05, 0x31, 0xc9, 0xc3];

        for code in [&exit_group[..], &exit[..]].iter() {
            let mut state = blank_state();
            store_code(&mut state, FUNCTION, code);

            let stepper = Stepper::new(Hooks::new(), lifter(), true);
            let driver = driver_at(state, FUNCTION);
            let driver = run_until(&stepper, driver, FUNCTION + 5);

            assert!(stepper.step(driver).unwrap().is_empty());
            assert_eq!(stepper.syscalls_bypassed(), 0);
        }
    }

    #[test]
    fn syscalls_error_without_bypass() {
        let mut state = blank_state();
        store_code(&mut state, FUNCTION, &[0x0f, 0x05, 0x31, 0xc9, 0xc3]);

        let stepper = Stepper::new(Hooks::new(), lifter(), false);
        let mut driver = driver_at(state, FUNCTION);
        let mut errored = false;
        for _ in 0..0x10 {
            match stepper.step(driver) {
                Ok(mut successors) => driver = successors.pop().unwrap(),
                Err(_) => {
                    errored = true;
                    break;
                }
            }
        }
        assert!(errored);
    }
}
