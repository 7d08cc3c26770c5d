//! Calling convention identifiers (spec §6 "ABI surface").
//!
//! A narrow `CallConv`, covering only the three ABIs this back-end targets
//! rather than the WebAssembly/Baldrdash and cold/fast internal conventions
//! a general-purpose compiler back-end would also need.

use core::fmt;
use core::str;
use target_lexicon::{CallingConvention, OperatingSystem, Triple};

/// Calling convention identifiers (spec §6 "Calling conventions honored").
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// x86-64 System V (Linux, macOS, \*BSD).
    SystemV,
    /// Microsoft x64 ("Windows fastcall").
    WindowsFastcall,
    /// AArch64 AAPCS64.
    Aapcs64,
}

impl CallConv {
    /// The calling convention implied by a target triple: AAPCS64 for any
    /// aarch64 target, Windows x64 for `x86_64-pc-windows-*`, System V
    /// otherwise.
    pub fn triple_default(triple: &Triple) -> Self {
        use target_lexicon::Architecture;
        if matches!(triple.architecture, Architecture::Aarch64(_)) {
            return CallConv::Aapcs64;
        }
        match triple.default_calling_convention() {
            Ok(CallingConvention::WindowsFastcall) => CallConv::WindowsFastcall,
            _ if triple.operating_system == OperatingSystem::Windows => {
                CallConv::WindowsFastcall
            }
            _ => CallConv::SystemV,
        }
    }

    /// Does this convention reserve 32 bytes of caller-allocated "shadow
    /// space" around every call site (spec §4.6 "Indirect calls on Windows
    /// reserve shadow space")?
    pub fn reserves_shadow_space(self) -> bool {
        matches!(self, CallConv::WindowsFastcall)
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            CallConv::SystemV => "system_v",
            CallConv::WindowsFastcall => "windows_fastcall",
            CallConv::Aapcs64 => "aapcs64",
        })
    }
}

impl str::FromStr for CallConv {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system_v" => Ok(CallConv::SystemV),
            "windows_fastcall" => Ok(CallConv::WindowsFastcall),
            "aapcs64" => Ok(CallConv::Aapcs64),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use target_lexicon::Triple;

    #[test]
    fn aarch64_triple_selects_aapcs64() {
        let t: Triple = "aarch64-unknown-linux-gnu".parse().unwrap();
        assert_eq!(CallConv::triple_default(&t), CallConv::Aapcs64);
    }

    #[test]
    fn x86_64_linux_selects_system_v() {
        let t: Triple = "x86_64-unknown-linux-gnu".parse().unwrap();
        assert_eq!(CallConv::triple_default(&t), CallConv::SystemV);
    }
}
