//! Helpers for poking at an Amd64 `State` the way the System V ABI expects.

use crate::error::*;
use falcon::architecture::Architecture;
use falcon::{il, RC};
use finch::executor::{Driver, State, StateTranslator};

const ARGUMENT_REGISTERS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

/// Moves drivers around the program, lifting functions as they are needed.
#[derive(Clone)]
pub struct Lifter {
    architecture: RC<Box<dyn Architecture>>,
}

impl Lifter {
    pub fn new(architecture: RC<Box<dyn Architecture>>) -> Lifter {
        Lifter { architecture }
    }

    /// Relocate the driver to the given address.
    ///
    /// If no lifted function holds the address yet, the function starting
    /// there is lifted out of the driver's memory and added to its program.
    pub fn jump(&self, mut driver: Driver, address: u64) -> Result<Driver> {
        let location: Option<il::ProgramLocation> =
            il::RefProgramLocation::from_address(driver.program(), address)
                .map(|location| location.into());

        if let Some(location) = location {
            driver.set_location(location);
            return Ok(driver);
        }

        let program = driver.program().clone();
        self.lift(program, driver.into(), address)
    }

    /// A new driver at `address`, with the function there lifted out of the
    /// state's memory.
    pub fn driver(&self, state: State, address: u64) -> Result<Driver> {
        self.lift(il::Program::new(), state, address)
    }

    fn lift(&self, mut program: il::Program, state: State, address: u64) -> Result<Driver> {
        trace!("Lifting function at 0x{:x}", address);

        let state_translator = StateTranslator::new(state);
        let function = self
            .architecture
            .translator()
            .translate_function(&state_translator, address)?;

        program.add_function(function);

        let location: il::ProgramLocation = il::RefProgramLocation::from_address(&program, address)
            .ok_or_else(|| format!("Unable to get program location for 0x{:x}", address))?
            .into();

        Ok(Driver::new(
            program,
            location,
            state_translator.into(),
            self.architecture.clone(),
        ))
    }
}

/// Evaluate an expression down to one concrete value, constraining the state
/// to that value.
pub fn concretize(state: &mut State, expression: &il::Expression) -> Result<u64> {
    state
        .eval_and_concretize(expression)?
        .and_then(|constant| constant.value_u64())
        .ok_or_else(|| ErrorKind::Unconcretizable(format!("{}", expression)).into())
}

pub fn register(state: &mut State, name: &str) -> Result<u64> {
    concretize(state, &il::expr_scalar(name, 64))
}

pub fn set_register(state: &mut State, name: &str, value: u64) -> Result<()> {
    Ok(state.set_scalar(name, &il::expr_const(value, 64))?)
}

/// The concrete value of an integer argument to the current function.
pub fn argument(state: &mut State, index: usize) -> Result<u64> {
    let name = ARGUMENT_REGISTERS
        .get(index)
        .ok_or_else(|| format!("No register for argument {}", index))?;
    register(state, name)
}

/// Set the return value of the current function.
pub fn set_return(state: &mut State, value: &il::Expression) -> Result<()> {
    Ok(state.set_scalar("rax", value)?)
}

pub fn push(state: &mut State, value: u64) -> Result<()> {
    let rsp = register(state, "rsp")? - 8;
    state.memory_mut().store(rsp, &il::expr_const(value, 64))?;
    set_register(state, "rsp", rsp)
}

pub fn pop(state: &mut State) -> Result<u64> {
    let rsp = register(state, "rsp")?;
    let value = state
        .memory()
        .load(rsp, 64)?
        .ok_or(ErrorKind::MissingMemory(rsp))?;
    let value = concretize(state, &value)?;
    set_register(state, "rsp", rsp + 8)?;
    Ok(value)
}

/// Load `length` bytes as expressions, failing on uninitialized memory.
pub fn read_bytes(state: &State, address: u64, length: u64) -> Result<Vec<il::Expression>> {
    (0..length)
        .map(|offset| -> Result<il::Expression> {
            state
                .memory()
                .load(address + offset, 8)?
                .ok_or_else(|| ErrorKind::MissingMemory(address + offset).into())
        })
        .collect()
}
