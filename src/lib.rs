pub mod analysis;
pub mod ast;
pub mod compiler;
pub mod finalize;
pub mod inst;

pub use analysis::{Profile, Reducer, UseDefs};
pub use compiler::{CompileError, CompiledBody, Compiler};
pub use finalize::{finalize_functions, FuncInfo};
