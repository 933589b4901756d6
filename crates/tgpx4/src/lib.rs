//! Architectural definitions for the Fujitsu MB86235 "TGPx4" DSP.
pub mod bundle;
pub mod fifo;
pub mod reg;

use bitos::bitos;
use strum::{Display, EnumString, FromRepr, VariantArray};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub use bundle::Bundle;
pub use fifo::{Fifo, FifoError, FifoId, Fifos};
pub use reg::Reg;

/// Number of entries in the parameter ring buffer.
pub const PR_LEN: usize = 24;
/// Number of entries in the program counter stack.
pub const PCS_LEN: usize = 4;
/// Number of status flags.
pub const FLAG_COUNT: usize = 14;
/// Number of words in each FIFO.
pub const FIFO_LEN: usize = 8;

/// Size, in words, of the internal RAM-A window. Addresses at or above this go through the
/// external bus window.
pub const RAM_A_WINDOW: u32 = 0x400;
/// Size, in words, of RAM-B.
pub const RAM_B_LEN: u32 = 0x400;
/// Mask selecting the bus window bits of an external address.
pub const BUS_WINDOW_MASK: u32 = 0x3FFF;

/// Bit of `MOD` selecting round-to-nearest (set) or truncation (clear) for conversions.
pub const MOD_ROUND_NEAREST: u32 = 7;

/// A status flag.
///
/// The ALU group (AZ..ZD) and the MUL group (MN..MD) are updated independently, so both units may
/// define flags in the same bundle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr, VariantArray,
)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum Flag {
    Az,
    An,
    Av,
    Au,
    Ad,
    Zc,
    Il,
    Nr,
    Zd,
    Mn,
    Mz,
    Mv,
    Mu,
    Md,
}

impl Flag {
    /// Returns the flag tested by condition code `cc`, if it is a valid one.
    pub fn from_condition(cc: u8) -> Option<Self> {
        Some(match cc {
            0 => Flag::Mn,
            1 => Flag::Mz,
            2 => Flag::Mv,
            3 => Flag::Mu,
            4 => Flag::Zd,
            5 => Flag::Nr,
            6 => Flag::Il,
            7 => Flag::Zc,
            8 => Flag::An,
            9 => Flag::Az,
            10 => Flag::Av,
            11 => Flag::Au,
            12 => Flag::Md,
            13 => Flag::Ad,
            _ => return None,
        })
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A set of [`Flag`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlagSet(pub u16);

impl FlagSet {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self((1 << FLAG_COUNT) - 1);

    pub const fn of(flags: &[Flag]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < flags.len() {
            bits |= 1 << flags[i] as u16;
            i += 1;
        }

        Self(bits)
    }

    #[inline(always)]
    pub fn contains(self, flag: Flag) -> bool {
        self.0 & (1 << flag as u16) != 0
    }

    #[inline(always)]
    pub fn insert(&mut self, flag: Flag) {
        self.0 |= 1 << flag as u16;
    }

    #[inline(always)]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline(always)]
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline(always)]
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Flag> {
        Flag::VARIANTS.iter().copied().filter(move |f| self.contains(*f))
    }
}

/// Packed view of the status flags.
#[bitos(16)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Status {
    #[bits(0)]
    pub az: bool,
    #[bits(1)]
    pub an: bool,
    #[bits(2)]
    pub av: bool,
    #[bits(3)]
    pub au: bool,
    #[bits(4)]
    pub ad: bool,
    #[bits(5)]
    pub zc: bool,
    #[bits(6)]
    pub il: bool,
    #[bits(7)]
    pub nr: bool,
    #[bits(8)]
    pub zd: bool,
    #[bits(9)]
    pub mn: bool,
    #[bits(10)]
    pub mz: bool,
    #[bits(11)]
    pub mv: bool,
    #[bits(12)]
    pub mu: bool,
    #[bits(13)]
    pub md: bool,
}

/// The register file of a TGPx4.
///
/// Generated code accesses this structure directly through field offsets, so every field is a
/// 32-bit word and the layout is fixed.
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Registers {
    pub pc: u32,
    pub aa: [u32; 8],
    pub ab: [u32; 8],
    pub ma: [u32; 8],
    pub mb: [u32; 8],
    pub ar: [u32; 8],

    pub sp: u32,
    pub eb: u32,
    pub eo: u32,
    pub mode: u32,
    pub pdr: u32,
    pub ddr: u32,

    /// Parameter ring buffer read pointer.
    pub prp: u32,
    /// Parameter ring buffer write pointer.
    pub pwp: u32,
    pub pr: [u32; PR_LEN],

    pub pcs: [u32; PCS_LEN],
    pub pcs_ptr: u32,

    /// One word per [`Flag`], either 0 or 1.
    pub flags: [u32; FLAG_COUNT],

    // == translator scratch
    /// Remaining cycle budget.
    pub icount: i32,
    /// Target of a dynamic branch.
    pub jmpdest: u32,
    /// Parameter of the last exception handle invocation.
    pub exp: u32,
    /// Arguments for handles.
    pub arg: [u32; 4],
    /// Pending trap bits, see [`Trap`].
    pub trap: u32,
}

/// Bits of [`Registers::trap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Trap {
    /// A fault was recorded by a host call.
    Fault = 1 << 0,
    /// The host requested the translation cache to be reset.
    ResetCache = 1 << 1,
}

impl Registers {
    #[inline(always)]
    pub fn flag(&self, flag: Flag) -> bool {
        self.flags[flag.index()] != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, flag: Flag, value: bool) {
        self.flags[flag.index()] = value as u32;
    }

    /// Returns the packed status flags.
    pub fn status(&self) -> Status {
        let mut bits = 0u16;
        for flag in Flag::VARIANTS {
            bits |= (self.flag(*flag) as u16) << (*flag as u16);
        }

        Status::from_bits(bits)
    }

    #[inline(always)]
    pub fn trap_pending(&self, trap: Trap) -> bool {
        self.trap & trap as u32 != 0
    }

    #[inline(always)]
    pub fn raise_trap(&mut self, trap: Trap) {
        self.trap |= trap as u32;
    }

    #[inline(always)]
    pub fn clear_trap(&mut self, trap: Trap) {
        self.trap &= !(trap as u32);
    }
}

/// Memory ports of the system a TGPx4 lives in. All addresses are word addresses.
pub trait Bus {
    /// Fetches the bundle at `pc`, or `None` if no program memory backs it.
    fn fetch(&mut self, pc: u32) -> Option<u64>;

    /// Reads from the internal RAM-A window (`addr < RAM_A_WINDOW`).
    fn read_a(&mut self, addr: u32) -> u32;
    /// Writes to the internal RAM-A window (`addr < RAM_A_WINDOW`).
    fn write_a(&mut self, addr: u32, value: u32);

    fn read_b(&mut self, addr: u32) -> u32;
    fn write_b(&mut self, addr: u32, value: u32);

    /// Reads from the external bus.
    fn read_external(&mut self, addr: u32) -> u32;
    /// Writes to the external bus.
    fn write_external(&mut self, addr: u32, value: u32);

    /// Returns whether program memory changed since the last call, which invalidates every
    /// translated block.
    fn take_code_invalidation(&mut self) -> bool {
        false
    }
}

/// Translates an address at or above [`RAM_A_WINDOW`] into an external bus address.
#[inline(always)]
pub fn bus_window_address(addr: u32, eb: u32) -> u32 {
    (addr & BUS_WINDOW_MASK) | (eb & !BUS_WINDOW_MASK)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn condition_codes() {
        assert_eq!(Flag::from_condition(0), Some(Flag::Mn));
        assert_eq!(Flag::from_condition(9), Some(Flag::Az));
        assert_eq!(Flag::from_condition(13), Some(Flag::Ad));
        assert_eq!(Flag::from_condition(14), None);
        assert_eq!(Flag::from_condition(15), None);
    }

    #[test]
    fn status_packing() {
        let mut regs = Registers::default();
        regs.set_flag(Flag::Az, true);
        regs.set_flag(Flag::Md, true);

        let status = regs.status();
        assert!(status.az());
        assert!(status.md());
        assert!(!status.an());
        assert_eq!(status.to_bits(), (1 << 0) | (1 << 13));
    }

    #[test]
    fn flag_sets() {
        let set = FlagSet::of(&[Flag::An, Flag::Az]);
        assert!(set.contains(Flag::An));
        assert!(!set.contains(Flag::Av));
        assert_eq!(set.iter().count(), 2);
        assert_eq!(FlagSet::ALL.difference(set).iter().count(), FLAG_COUNT - 2);
    }

    #[test]
    fn window_translation() {
        assert_eq!(bus_window_address(0x4123, 0x0001_0000), 0x0001_0123);
        assert_eq!(bus_window_address(0x0500, 0x0002_3FFF), 0x0002_0500);
    }

    #[test]
    fn layout_has_no_padding() {
        // every field is a 32-bit word
        assert_eq!(std::mem::size_of::<Registers>() % 4, 0);
        assert_eq!(std::mem::align_of::<Registers>(), 4);
    }
}
