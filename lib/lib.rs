//! Symbolic execution assisted solver for the WhitehatCTF 2015 crypto400
//! crackme.
//!
//! Finch drives the statically-linked target through its first stage with
//! libc summaries hooked in. Stage one narrows the 8-byte passphrase to a set
//! of printable candidates, and the remaining keyspace is brute-forced
//! against the real binary.
extern crate byteorder;
#[macro_use]
extern crate error_chain;
extern crate falcon;
extern crate falcon_z3;
extern crate finch;
extern crate goblin;
extern crate itertools;
#[macro_use]
extern crate log;
extern crate rayon;

pub mod bruteforce;
pub mod explore;
pub mod hooks;
pub mod loader;
pub mod machine;
pub mod solve;
pub mod solver;
pub mod stepper;
pub mod summaries;
pub mod target;

pub mod error {
    error_chain! {
        types {
            Error, ErrorKind, ResultExt, Result;
        }

        foreign_links {
            Falcon(::falcon::error::Error);
            FalconZ3(::falcon_z3::error::Error);
            Finch(::finch::error::Error);
            FromUtf8Error(::std::string::FromUtf8Error);
            Goblin(::goblin::error::Error);
            IoError(::std::io::Error);
            ThreadPool(::rayon::ThreadPoolBuildError);
        }

        errors {
            MissingMemory(address: u64) {
                description("Read from uninitialized memory")
                display("Read from uninitialized memory at 0x{:x}", address)
            }
            NoPathFound(address: u64) {
                description("Exploration found no path to the target")
                display("Exploration found no path to 0x{:x}", address)
            }
            TargetMismatch(reason: String) {
                description("Binary does not look like the expected target")
                display("Binary does not look like the expected target: {}", reason)
            }
            Unconcretizable(what: String) {
                description("Could not concretize a symbolic value")
                display("Could not concretize {}", what)
            }
        }
    }
}
