//! Destination grammar of the signaling endpoints.
//!
//! A client-dialed destination number selects what its session does:
//!
//! | dest | meaning |
//! |---|---|
//! | `e` | echo on the KMS engine |
//! | `fe` | echo on the FS engine |
//! | `fp` / `fA` | park on the FS engine |
//! | `m<room>` / `fm<room>` | join MCU `<room>` on the FS engine |
//! | `fsession-…` | bridge to the named session on the FS engine |
//! | anything else | multi-leg call fan-out through the resolver chain |
//!
//! The SIP endpoint uses a reduced form: destinations starting with `mcu`
//! join the MCU room of that name, anything else fans out.

use mediahub_session_core::{BackendId, RoomId, SessionId};

/// What a dialed destination asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum DestSpec {
    Echo { backend: BackendId },
    Park,
    Mcu { room: RoomId },
    BridgeTo { session: SessionId },
    Call { callee: String },
}

/// Parse a Verto destination number.
pub fn parse_dest(dest: &str) -> DestSpec {
    if dest == "e" {
        return DestSpec::Echo {
            backend: BackendId::kms(),
        };
    }
    if dest == "fe" {
        return DestSpec::Echo {
            backend: BackendId::fs(),
        };
    }
    if dest == "fp" || dest == "fA" {
        return DestSpec::Park;
    }
    if let Some(room) = dest.strip_prefix("fm") {
        if !room.is_empty() {
            return DestSpec::Mcu {
                room: RoomId::named(room),
            };
        }
    }
    if let Some(rest) = dest.strip_prefix('f') {
        if rest.starts_with("session-") {
            return DestSpec::BridgeTo {
                session: SessionId(rest.to_string()),
            };
        }
    }
    if let Some(room) = dest.strip_prefix('m') {
        if !room.is_empty() {
            return DestSpec::Mcu {
                room: RoomId::named(room),
            };
        }
    }
    DestSpec::Call {
        callee: dest.to_string(),
    }
}

/// Parse a SIP request-URI user part.
pub fn parse_sip_dest(dest: &str) -> DestSpec {
    if dest.starts_with("mcu") {
        return DestSpec::Mcu {
            room: RoomId::named(dest),
        };
    }
    DestSpec::Call {
        callee: dest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verto_grammar() {
        assert_eq!(
            parse_dest("e"),
            DestSpec::Echo {
                backend: BackendId::kms()
            }
        );
        assert_eq!(
            parse_dest("fe"),
            DestSpec::Echo {
                backend: BackendId::fs()
            }
        );
        assert_eq!(parse_dest("fA"), DestSpec::Park);
        assert_eq!(
            parse_dest("mroom1"),
            DestSpec::Mcu {
                room: RoomId::named("room1")
            }
        );
        assert_eq!(
            parse_dest("fmroom2"),
            DestSpec::Mcu {
                room: RoomId::named("room2")
            }
        );
        assert_eq!(
            parse_dest("fsession-1234"),
            DestSpec::BridgeTo {
                session: SessionId("session-1234".to_string())
            }
        );
        assert_eq!(
            parse_dest("alice"),
            DestSpec::Call {
                callee: "alice".to_string()
            }
        );
    }

    #[test]
    fn sip_grammar() {
        assert_eq!(
            parse_sip_dest("mcu1"),
            DestSpec::Mcu {
                room: RoomId::named("mcu1")
            }
        );
        assert_eq!(
            parse_sip_dest("bob"),
            DestSpec::Call {
                callee: "bob".to_string()
            }
        );
    }
}
