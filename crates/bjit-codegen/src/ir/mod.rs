//! The IR data model (spec §3): entity references, the `Op`/`Block`/
//! `Procedure` records, the opcode table, and the constant pool.

pub mod block;
pub mod constant_pool;
pub mod entities;
pub mod op;
pub mod opcode;
pub mod procedure;
pub mod types;

pub use block::{Block, PhiAlternative, PhiArg};
pub use constant_pool::{ConstantHandle, ConstantPool, PoolLayout};
pub use entities::{Block as BlockRef, Op, Proc};
pub use op::{OpData, OpRecord};
pub use opcode::{InputArity, Opcode, OpcodeInfo};
pub use procedure::{CallArg, NearCallReloc, Procedure};
pub use types::{MemWidth, RegUnit, Type};
