use crate::{FLAG_COUNT, Flag, PCS_LEN, PR_LEN, Registers};
use easyerr::Error;
use std::{fmt::Display, str::FromStr};
use strum::VariantArray;

/// An architectural register, individually nameable for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Pc,
    Aa(u8),
    Ab(u8),
    Ma(u8),
    Mb(u8),
    Ar(u8),
    Sp,
    Eb,
    Eo,
    Mod,
    Pdr,
    Ddr,
    Prp,
    Pwp,
    Pr(u8),
    Pcs(u8),
    PcsPtr,
    Flag(Flag),
}

#[derive(Debug, Error)]
pub enum ParseRegError {
    #[error("unknown register {f0:?}")]
    Unknown(String),
}

impl Reg {
    /// Every register, in display order.
    pub fn all() -> impl Iterator<Item = Reg> {
        let banks: [fn(u8) -> Reg; 5] = [Reg::Aa, Reg::Ab, Reg::Ma, Reg::Mb, Reg::Ar];

        std::iter::once(Reg::Pc)
            .chain(banks.into_iter().flat_map(|bank| (0..8).map(bank)))
            .chain([
                Reg::Sp,
                Reg::Eb,
                Reg::Eo,
                Reg::Mod,
                Reg::Pdr,
                Reg::Ddr,
                Reg::Prp,
                Reg::Pwp,
            ])
            .chain((0..PR_LEN as u8).map(Reg::Pr))
            .chain((0..PCS_LEN as u8).map(Reg::Pcs))
            .chain(std::iter::once(Reg::PcsPtr))
            .chain(Flag::VARIANTS.iter().copied().map(Reg::Flag))
    }
}

impl Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reg::Pc => write!(f, "PC"),
            Reg::Aa(i) => write!(f, "AA{i}"),
            Reg::Ab(i) => write!(f, "AB{i}"),
            Reg::Ma(i) => write!(f, "MA{i}"),
            Reg::Mb(i) => write!(f, "MB{i}"),
            Reg::Ar(i) => write!(f, "AR{i}"),
            Reg::Sp => write!(f, "SP"),
            Reg::Eb => write!(f, "EB"),
            Reg::Eo => write!(f, "EO"),
            Reg::Mod => write!(f, "MOD"),
            Reg::Pdr => write!(f, "PDR"),
            Reg::Ddr => write!(f, "DDR"),
            Reg::Prp => write!(f, "PRP"),
            Reg::Pwp => write!(f, "PWP"),
            Reg::Pr(i) => write!(f, "PR{i}"),
            Reg::Pcs(i) => write!(f, "PCS{i}"),
            Reg::PcsPtr => write!(f, "PCSP"),
            Reg::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

impl FromStr for Reg {
    type Err = ParseRegError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        Reg::all()
            .find(|reg| reg.to_string() == upper)
            .ok_or(ParseRegError::Unknown(s.to_owned()))
    }
}

impl Registers {
    /// Reads the given register.
    pub fn get(&self, reg: Reg) -> u32 {
        match reg {
            Reg::Pc => self.pc,
            Reg::Aa(i) => self.aa[i as usize & 7],
            Reg::Ab(i) => self.ab[i as usize & 7],
            Reg::Ma(i) => self.ma[i as usize & 7],
            Reg::Mb(i) => self.mb[i as usize & 7],
            Reg::Ar(i) => self.ar[i as usize & 7],
            Reg::Sp => self.sp,
            Reg::Eb => self.eb,
            Reg::Eo => self.eo,
            Reg::Mod => self.mode,
            Reg::Pdr => self.pdr,
            Reg::Ddr => self.ddr,
            Reg::Prp => self.prp,
            Reg::Pwp => self.pwp,
            Reg::Pr(i) => self.pr[i as usize % PR_LEN],
            Reg::Pcs(i) => self.pcs[i as usize % PCS_LEN],
            Reg::PcsPtr => self.pcs_ptr,
            Reg::Flag(flag) => self.flags[flag.index()],
        }
    }

    /// Writes the given register. Pointers and flags are kept within their valid range.
    pub fn set(&mut self, reg: Reg, value: u32) {
        match reg {
            Reg::Pc => self.pc = value,
            Reg::Aa(i) => self.aa[i as usize & 7] = value,
            Reg::Ab(i) => self.ab[i as usize & 7] = value,
            Reg::Ma(i) => self.ma[i as usize & 7] = value,
            Reg::Mb(i) => self.mb[i as usize & 7] = value,
            Reg::Ar(i) => self.ar[i as usize & 7] = value,
            Reg::Sp => self.sp = value,
            Reg::Eb => self.eb = value,
            Reg::Eo => self.eo = value,
            Reg::Mod => self.mode = value,
            Reg::Pdr => self.pdr = value,
            Reg::Ddr => self.ddr = value,
            Reg::Prp => self.prp = value % PR_LEN as u32,
            Reg::Pwp => self.pwp = value % PR_LEN as u32,
            Reg::Pr(i) => self.pr[i as usize % PR_LEN] = value,
            Reg::Pcs(i) => self.pcs[i as usize % PCS_LEN] = value,
            Reg::PcsPtr => self.pcs_ptr = value.min(PCS_LEN as u32),
            Reg::Flag(flag) => self.flags[flag.index()] = value & 1,
        }
    }
}

const _: () = assert!(FLAG_COUNT == Flag::VARIANTS.len());

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn names_round_trip() {
        for reg in Reg::all() {
            let name = reg.to_string();
            assert_eq!(name.parse::<Reg>().unwrap(), reg, "{name}");
        }

        assert_eq!("aa3".parse::<Reg>().unwrap(), Reg::Aa(3));
        assert!("XX0".parse::<Reg>().is_err());
    }

    #[test]
    fn set_keeps_invariants() {
        let mut regs = Registers::default();
        regs.set(Reg::PcsPtr, 9);
        assert_eq!(regs.get(Reg::PcsPtr), 4);

        regs.set(Reg::Prp, 25);
        assert_eq!(regs.get(Reg::Prp), 1);

        regs.set(Reg::Flag(Flag::Zc), 0xFF);
        assert!(regs.flag(Flag::Zc));
    }
}
