//! Summaries of libc functions, used in place of the statically-linked code.
//!
//! Each summary reads its arguments out of the System V argument registers,
//! applies its effects to the `State`, and tells the hook where to resume.

use crate::error::*;
use crate::hooks::{Hook, Resume};
use crate::machine;
use falcon::il;
use finch::executor::State;
use std::cell::Cell;

/// `__libc_start_main(main, argc, argv, ...)`.
///
/// Skips libc initialization and enters `main(argc, argv, envp)` directly.
/// The return address pushed by `_start` is left in place for `main` to
/// return through.
pub fn libc_start_main(state: &mut State) -> Result<Resume> {
    let main = machine::argument(state, 0)?;
    let argc = machine::argument(state, 1)?;
    let argv = machine::argument(state, 2)?;
    let envp = argv + (argc + 1) * 8;

    trace!(
        "__libc_start_main main=0x{:x} argc={} argv=0x{:x}",
        main,
        argc,
        argv
    );

    machine::set_register(state, "rdi", argc)?;
    machine::set_register(state, "rsi", argv)?;
    machine::set_register(state, "rdx", envp)?;

    Ok(Resume::Jump(main))
}

/// `memcpy(dst, src, n)`, with `n` concretized.
pub fn memcpy(state: &mut State) -> Result<Resume> {
    let dst = machine::argument(state, 0)?;
    let src = machine::argument(state, 1)?;
    let n = machine::argument(state, 2)?;

    trace!("memcpy(0x{:x}, 0x{:x}, {})", dst, src, n);

    let bytes = machine::read_bytes(state, src, n)?;
    for (offset, byte) in bytes.iter().enumerate() {
        state.memory_mut().store(dst + offset as u64, byte)?;
    }

    machine::set_return(state, &il::expr_const(dst, 64))?;
    Ok(Resume::Return)
}

/// `puts(s)`. The string is logged when it is concrete.
pub fn puts(state: &mut State) -> Result<Resume> {
    let s = machine::argument(state, 0)?;

    let length = match state.get_string(s)? {
        Some(string) => {
            info!("puts: {}", string);
            string.len() as u64
        }
        None => {
            debug!("puts of a symbolic string at 0x{:x}", s);
            0
        }
    };

    machine::set_return(state, &il::expr_const(length + 1, 64))?;
    Ok(Resume::Return)
}

/// Returns a fresh, unconstrained value from whatever function this hooks.
pub fn return_unconstrained() -> impl Fn(&mut State) -> Result<Resume> {
    let next = Cell::new(0usize);
    move |state: &mut State| {
        let name = format!("unconstrained_{}", next.get());
        next.set(next.get() + 1);
        machine::set_return(state, &il::expr_scalar(name, 64))?;
        Ok(Resume::Return)
    }
}

/// Sets a register to a constant and skips over the hooked instructions.
pub fn set_register(register: &'static str, value: u64) -> impl Fn(&mut State) -> Result<Resume> {
    move |state: &mut State| {
        machine::set_register(state, register, value)?;
        Ok(Resume::Skip)
    }
}

/// Every summary a `Target` can ask for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Summary {
    LibcStartMain,
    Memcpy,
    Puts,
    ReturnUnconstrained,
}

impl Summary {
    pub fn name(&self) -> &'static str {
        match self {
            Summary::LibcStartMain => "__libc_start_main",
            Summary::Memcpy => "memcpy",
            Summary::Puts => "puts",
            Summary::ReturnUnconstrained => "ReturnUnconstrained",
        }
    }

    pub fn hook(&self) -> Hook {
        match self {
            Summary::LibcStartMain => Hook::function(self.name(), libc_start_main),
            Summary::Memcpy => Hook::function(self.name(), memcpy),
            Summary::Puts => Hook::function(self.name(), puts),
            Summary::ReturnUnconstrained => Hook::function(self.name(), return_unconstrained()),
        }
    }
}
