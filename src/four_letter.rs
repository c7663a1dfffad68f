// ABOUTME: The closed set of four-letter ASCII diagnostic probes
// ABOUTME: Recognised only pre-handshake, by treating the length field as 4 ASCII bytes

use num_enum::TryFromPrimitive;

fn pack(token: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*token)
}

/// A 32-bit integer formed by the big-endian packing of four ASCII bytes.
/// Looked up in place of a length field while a connection is
/// pre-handshake.
#[derive(TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FourLetterWord {
    Conf = 0x636f_6e66,
    Cons = 0x636f_6e73,
    Crst = 0x6372_7374,
    Dump = 0x6475_6d70,
    Envi = 0x656e_7669,
    Gtmk = 0x6774_6d6b,
    Ruok = 0x7275_6f6b,
    Stmk = 0x7374_6d6b,
    Srst = 0x7372_7374,
    Srvr = 0x7372_7672,
    Stat = 0x7374_6174,
    Wchc = 0x7763_6863,
    Wchp = 0x7763_6870,
    Wchs = 0x7763_6873,
}

impl FourLetterWord {
    /// Look up a raw big-endian length-field value against the closed
    /// probe set. Returns `None` for any value that should instead be
    /// treated as a frame length.
    pub fn lookup(raw: u32) -> Option<FourLetterWord> {
        FourLetterWord::try_from(raw).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FourLetterWord::Conf => "conf",
            FourLetterWord::Cons => "cons",
            FourLetterWord::Crst => "crst",
            FourLetterWord::Dump => "dump",
            FourLetterWord::Envi => "envi",
            FourLetterWord::Gtmk => "gtmk",
            FourLetterWord::Ruok => "ruok",
            FourLetterWord::Stmk => "stmk",
            FourLetterWord::Srst => "srst",
            FourLetterWord::Srvr => "srvr",
            FourLetterWord::Stat => "stat",
            FourLetterWord::Wchc => "wchc",
            FourLetterWord::Wchp => "wchp",
            FourLetterWord::Wchs => "wchs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_tokens_round_trip_through_their_ascii_bytes() {
        let tokens: &[(&[u8; 4], FourLetterWord)] = &[
            (b"conf", FourLetterWord::Conf),
            (b"cons", FourLetterWord::Cons),
            (b"crst", FourLetterWord::Crst),
            (b"dump", FourLetterWord::Dump),
            (b"envi", FourLetterWord::Envi),
            (b"gtmk", FourLetterWord::Gtmk),
            (b"ruok", FourLetterWord::Ruok),
            (b"stmk", FourLetterWord::Stmk),
            (b"srst", FourLetterWord::Srst),
            (b"srvr", FourLetterWord::Srvr),
            (b"stat", FourLetterWord::Stat),
            (b"wchc", FourLetterWord::Wchc),
            (b"wchp", FourLetterWord::Wchp),
            (b"wchs", FourLetterWord::Wchs),
        ];
        for (bytes, expected) in tokens {
            assert_eq!(FourLetterWord::lookup(pack(bytes)), Some(*expected));
            assert_eq!(FourLetterWord::lookup(pack(bytes)).unwrap().as_str(), expected.as_str());
        }
    }

    #[test]
    fn an_ordinary_frame_length_is_not_mistaken_for_a_probe() {
        // A typical ConnectRequest frame length, e.g. 44, must never collide
        // with the probe set.
        assert_eq!(FourLetterWord::lookup(44), None);
    }
}
