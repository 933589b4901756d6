use std::fmt::Write;
use tgpcore::tgpx4::bundle::{
    AluOp, BranchTarget, Bundle, ControlOp, Dest, Location, MulOp, Source, Transfer, XferReg,
};

fn source(source: Source) -> String {
    match source {
        Source::Aa(i) => format!("AA{i}"),
        Source::Ab(i) => format!("AB{i}"),
        Source::Ma(i) => format!("MA{i}"),
        Source::Mb(i) => format!("MB{i}"),
        Source::Pr(mode) => format!("PR({mode:?})"),
        Source::Const(index) => format!("#{index}"),
    }
}

fn dest(dest: Dest) -> String {
    match dest {
        Dest::Ma(i) => format!("MA{i}"),
        Dest::Mb(i) => format!("MB{i}"),
        Dest::Aa(i) => format!("AA{i}"),
        Dest::Ab(i) => format!("AB{i}"),
    }
}

fn operands(first: Source, second: Option<Source>, out: Dest) -> String {
    let second = second.map_or_else(|| "?".to_owned(), source);
    format!("{}, {second} -> {}", source(first), dest(out))
}

fn alu(op: AluOp) -> String {
    format!(
        "{:?} {}",
        op.opcode(),
        operands(op.first(), op.second(), op.dest())
    )
}

fn mul(op: MulOp) -> String {
    let name = if op.float() { "FMUL" } else { "MUL" };
    format!("{name} {}", operands(op.first(), op.second(), op.dest()))
}

fn location(location: Location) -> String {
    match location {
        Location::Reg(reg) => XferReg::decode(reg)
            .map_or_else(|| format!("reg({reg:02X})"), |reg| format!("{reg:?}")),
        Location::Imm => "imm".to_owned(),
        Location::RamA { ar } => format!("A[AR{ar}]"),
        Location::RamB { ar } => format!("B[AR{ar}]"),
    }
}

fn control(op: ControlOp) -> String {
    let Some(opcode) = op.opcode() else {
        return format!("unknown ({:02X})", op.cop().value());
    };

    if !opcode.is_branch() {
        return format!("{opcode:?} ef1={:02X} ef2={:04X}", op.ef1().value(), op.ef2());
    }

    let target = match op.target() {
        BranchTarget::Relative(disp) => format!("pc{disp:+}"),
        BranchTarget::Ar(ar) => format!("AR{ar}"),
        BranchTarget::Invalid(ty) => format!("invalid({ty})"),
    };

    format!("{opcode:?} cc={} -> {target}", op.condition())
}

/// Describes the slots of a bundle, one per line.
pub fn describe(word: u64) -> String {
    let bundle = Bundle::new(word);
    let slots = bundle.slots();

    let mut out = String::new();
    _ = writeln!(out, "{word:016X} {:?}", bundle.format());

    if let Some(op) = slots.alu {
        _ = writeln!(out, "  alu      {}", alu(op));
    }

    if let Some(op) = slots.mul {
        _ = writeln!(out, "  mul      {}", mul(op));
    }

    if let Some(transfer) = slots.transfer {
        let text = match transfer {
            Transfer::Single1(t) => format!("{t:?}"),
            Transfer::Single2(t) => format!(
                "{} -> {} {t:?}",
                location(Location::decode(t.sr())),
                location(Location::decode(t.dr()))
            ),
            other => format!("{other:?}"),
        };

        _ = writeln!(out, "  transfer {text}");
    }

    if let Some(op) = slots.control {
        _ = writeln!(out, "  control  {}", control(op));
    }

    out
}
