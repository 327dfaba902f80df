//! Per-command reply layouts.
//!
//! Each known command code maps to an ordered list of named, typed
//! fields; the order is load-bearing, the names are labels for humans.
//! Commands without an entry are still answered with the raw payload.

use crate::field::FieldType::{self, Ascii, Bits, Float32, Uint};

/// One command's reply layout.
pub type Fields = &'static [(&'static str, FieldType)];

/// Look up the reply layout for a command code.
#[must_use]
pub fn lookup(command: u8) -> Option<Fields> {
    SCHEMAS
        .iter()
        .find(|(c, _)| *c == command)
        .map(|(_, fields)| *fields)
}

/// Look up the reply layout for a sub-command of the extended command
/// 0x98.
///
/// Sub-commands 12 (password registration), 30 (clock micro-adjust) and
/// 32 (extended holidays) exist on the meter but their layouts are not
/// mapped yet, so every sub-code currently resolves to `None` and the
/// caller falls back to raw bytes.
#[must_use]
pub fn lookup_sub98(sub: u8) -> Option<Fields> {
    SUB98_SCHEMAS
        .iter()
        .find(|(c, _)| *c == sub)
        .map(|(_, fields)| *fields)
}

static SUB98_SCHEMAS: &[(u8, Fields)] = &[];

static SCHEMAS: &[(u8, Fields)] = &[
    (0x11, &[("Result", Ascii(20))]),
    (0x12, &[("Password", Ascii(10))]),
    (0x13, &[("ChallengeString", Ascii(20))]),
    (
        0x14,
        &[
            ("DateTime", FieldType::DateTime),
            ("Inst1", Float32),
            ("Inst2", Float32),
            ("Inst3", Float32),
        ],
    ),
    (
        0x20,
        &[("ActiveEnergy", Float32), ("Demand", Float32), ("PF", Float32)],
    ),
    (
        0x21,
        &[("CurrentActiveEnergy", Float32), ("MeanCurrent", Float32)],
    ),
    (
        0x22,
        &[("PrevActiveEnergy", Float32), ("PrevDemand", Float32)],
    ),
    (0x23, &[("LastResetRegister", Float32)]),
    (0x24, &[("LastResetDemand", Float32)]),
    (
        0x25,
        &[
            ("OutageStart", FieldType::DateTime),
            ("OutageEnd", FieldType::DateTime),
        ],
    ),
    (
        0x26,
        &[
            ("Serial", Uint(4)),
            ("DateTime", FieldType::DateTime),
            ("V1", Float32),
            ("V2", Float32),
            ("V3", Float32),
        ],
    ),
    (0x27, &[("PrevMassMemory", Ascii(30))]),
    (
        0x28,
        &[("ChangeRecord1", Ascii(10)), ("ChangeRecord2", Ascii(10))],
    ),
    (0x29, &[("NewDate", FieldType::DateTime)]),
    (0x30, &[("NewTime", FieldType::DateTime)]),
    (0x31, &[("DemandInterval", Uint(2))]),
    (0x32, &[("NationalHolidays", Ascii(20))]),
    (0x33, &[("MultiplierConstants", Float32)]),
    (0x35, &[("TariffSegments", Ascii(10))]),
    (0x36, &[("ReservedSchedule", Ascii(10))]),
    (0x37, &[("DigitalRegisterEvent", Bits(1))]),
    (0x38, &[("DigitalRegisterInit", Ascii(10))]),
    (0x39, &[("NotImplementedReply", Ascii(20))]),
    (0x40, &[("DigitalRegisterOccurrence", Ascii(20))]),
    (0x41, &[("PrevRecordsCh1", Float32)]),
    (0x42, &[("PrevRecordsCh2", Float32)]),
    (0x43, &[("PrevRecordsCh3", Float32)]),
    (0x44, &[("CurrRecordsCh1", Float32)]),
    (0x45, &[("CurrRecordsCh2", Float32)]),
    (0x46, &[("CurrRecordsCh3", Float32)]),
    (0x47, &[("MaxDemandCalcMethod", Ascii(10))]),
    (0x51, &[("NoResetParams", Ascii(30))]),
    (0x52, &[("FullMassMemory", Ascii(50))]),
    (0x53, &[("ProgramLoadInit", Ascii(10))]),
    (0x54, &[("ProgramTransfer", Ascii(10))]),
    (0x55, &[("ProgramLoadEnd", Ascii(10))]),
    (0x63, &[("AutoResetDateTime", FieldType::DateTime)]),
    (0x64, &[("DstChange", Ascii(10))]),
    (0x65, &[("TariffSegmentsSet2", Ascii(10))]),
    (0x66, &[("ChannelQuantities", Ascii(20))]),
    (0x67, &[("ReactiveTariff", Ascii(20))]),
    (0x73, &[("MassMemoryInterval", Uint(2))]),
    (0x77, &[("WeekendHolidaySegments", Ascii(10))]),
    (0x78, &[("TariffTypeChange", Ascii(10))]),
    (0x79, &[("DisplayCodes", Ascii(10))]),
    (
        0x80,
        &[
            ("PT", Float32),
            ("CT", Float32),
            ("Ke", Float32),
            ("Ident", Ascii(14)),
        ],
    ),
    (0x81, &[("ExtendedConsumerSerial", Ascii(20))]),
    (0x87, &[("InstallationCode", Ascii(20))]),
    (0x90, &[("DisplayMode", Ascii(10))]),
    (0x95, &[("NewConstants", Float32), ("User", Ascii(10))]),
    (
        0x98,
        &[("ExtendedCommand", Ascii(10)), ("Subcommand", Uint(1))],
    ),
];
