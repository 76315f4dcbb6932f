//! CDMA SMS PDU codec (3GPP2 C.S0015-B framing).
//!
//! A PDU is a message-type byte followed by `{id, length, value}` parameter
//! records; the bearer-data parameter nests another `{id, length, value}`
//! sequence of subparameters. Fields inside values are bit-packed, read and
//! written through [`crate::cdma::bits`].
//!
//! Decode is deliberately permissive: real devices emit vendor parameters
//! and out-of-range enum values, so unknown records are logged and skipped
//! and missing mandatory parameters degrade to a diagnostic rather than a
//! parse failure. Encode is strict — we control what we emit.

use tracing::{debug, warn};

use crate::cdma::bits::{BitReader, BitWriter};
use crate::error::Error;

// Parameter IDs.
const PARAM_TELESERVICE_ID: u8 = 0x00;
const PARAM_SERVICE_CATEGORY: u8 = 0x01;
const PARAM_ORIGINATING_ADDRESS: u8 = 0x02;
const PARAM_ORIGINATING_SUBADDRESS: u8 = 0x03;
const PARAM_DESTINATION_ADDRESS: u8 = 0x04;
const PARAM_DESTINATION_SUBADDRESS: u8 = 0x05;
const PARAM_BEARER_REPLY_OPTION: u8 = 0x06;
const PARAM_CAUSE_CODES: u8 = 0x07;
const PARAM_BEARER_DATA: u8 = 0x08;

// Bearer-data subparameter IDs.
const SUBPARAM_MESSAGE_ID: u8 = 0x00;
const SUBPARAM_USER_DATA: u8 = 0x01;

// Address digit modes.
const DIGIT_MODE_DTMF: u16 = 0;
const DIGIT_MODE_ASCII: u16 = 1;

// Number types (ASCII digit mode only).
const NUMBER_TYPE_INTERNATIONAL: u16 = 1;
const NUMBERING_PLAN_ISDN: u16 = 1;

/// Field counts, parameter lengths and subparameter lengths all ride in
/// 8-bit fields.
const MAX_FIELDS: usize = 255;

/// Transport-layer message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    PointToPoint,
    Broadcast,
    Acknowledge,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::PointToPoint),
            1 => Some(Self::Broadcast),
            2 => Some(Self::Acknowledge),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::PointToPoint => 0,
            Self::Broadcast => 1,
            Self::Acknowledge => 2,
        }
    }
}

/// Teleservice identifier on point-to-point messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teleservice {
    /// IS-91 extended protocol.
    Cmt91,
    /// Wireless paging.
    Wpt,
    /// Wireless messaging (ordinary SMS).
    Wmt,
    /// Voice mail notification.
    Vmn,
    Wap,
    /// Enhanced messaging.
    Wemt,
    Scpt,
    Catpt,
    Other(u16),
}

impl Teleservice {
    pub fn from_u16(v: u16) -> Self {
        match v {
            0x1000 => Self::Cmt91,
            0x1001 => Self::Wpt,
            0x1002 => Self::Wmt,
            0x1003 => Self::Vmn,
            0x1004 => Self::Wap,
            0x1005 => Self::Wemt,
            0x1006 => Self::Scpt,
            0x1007 => Self::Catpt,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Cmt91 => 0x1000,
            Self::Wpt => 0x1001,
            Self::Wmt => 0x1002,
            Self::Vmn => 0x1003,
            Self::Wap => 0x1004,
            Self::Wemt => 0x1005,
            Self::Scpt => 0x1006,
            Self::Catpt => 0x1007,
            Self::Other(v) => v,
        }
    }
}

/// User-data character encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    Octet,
    Epm,
    Ascii7,
    Ia5,
    Unicode,
    ShiftJis,
    Korean,
    LatinHebrew,
    Latin,
    Gsm7,
    GsmDcs,
    Other(u8),
}

impl DataEncoding {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Octet,
            1 => Self::Epm,
            2 => Self::Ascii7,
            3 => Self::Ia5,
            4 => Self::Unicode,
            5 => Self::ShiftJis,
            6 => Self::Korean,
            7 => Self::LatinHebrew,
            8 => Self::Latin,
            9 => Self::Gsm7,
            10 => Self::GsmDcs,
            other => Self::Other(other),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Octet => 0,
            Self::Epm => 1,
            Self::Ascii7 => 2,
            Self::Ia5 => 3,
            Self::Unicode => 4,
            Self::ShiftJis => 5,
            Self::Korean => 6,
            Self::LatinHebrew => 7,
            Self::Latin => 8,
            Self::Gsm7 => 9,
            Self::GsmDcs => 10,
            Self::Other(v) => v,
        }
    }
}

/// Bearer-data message type (inside the message-identifier subparameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerMessageType {
    Deliver,
    Submit,
    Cancellation,
    DeliveryAck,
    UserAck,
    ReadAck,
    Other(u8),
}

impl BearerMessageType {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Deliver,
            2 => Self::Submit,
            3 => Self::Cancellation,
            4 => Self::DeliveryAck,
            5 => Self::UserAck,
            6 => Self::ReadAck,
            other => Self::Other(other),
        }
    }
}

/// Delivery state derived from a cause-codes parameter. Values follow the
/// 3GPP2 scheme: 0x000 completed, 0x200 + cause for permanent errors,
/// 0x300 + cause for temporary errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryState(pub u16);

impl DeliveryState {
    pub const COMPLETED_RECEIVED: Self = Self(0x000);
    const PERMANENT_BASE: u16 = 0x200;
    const TEMPORARY_BASE: u16 = 0x300;

    /// Map an error class + cause code. Cause codes in the reserved ranges
    /// collapse onto the nearest "other ..." bucket.
    pub fn from_cause(temporary: bool, cause: u8) -> Self {
        let offset: u16 = match cause {
            6..=31 => 0x05,    // other network problem
            40..=47 => 0x27,   // other terminal problem
            48..=63 => 0x24,   // SMS delivery postponed
            67..=95 => 0x42,   // other radio interface problem
            101 => 0x64,       // SMS not supported
            108..=255 => 0x6b, // other general problems
            direct => u16::from(direct),
        };
        let base = if temporary {
            Self::TEMPORARY_BASE
        } else {
            Self::PERMANENT_BASE
        };
        Self(base + offset)
    }

    pub fn is_temporary_error(self) -> bool {
        (Self::TEMPORARY_BASE..Self::TEMPORARY_BASE + 0x100).contains(&self.0)
    }
}

/// Domain model of one CDMA SMS part. Everything is optional because the
/// permissive decode path fills in whatever the wire actually carried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SmsPart {
    pub message_type: MessageType,
    pub teleservice: Option<Teleservice>,
    pub service_category: Option<u16>,
    /// Origination or destination number, depending on direction.
    pub number: Option<String>,
    /// Bearer-reply sequence number.
    pub reply_sequence: Option<u8>,
    pub delivery_state: Option<DeliveryState>,
    pub message_id: Option<u16>,
    pub bearer_message_type: Option<BearerMessageType>,
    pub text: Option<String>,
    /// Raw payload for octet-encoded user data.
    pub data: Option<Vec<u8>>,
}

impl SmsPart {
    /// Build a submit part ready for [`encode_submit`].
    pub fn submit(number: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::PointToPoint,
            teleservice: Some(Teleservice::Wmt),
            number: Some(number.into()),
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

// ── Decode ───────────────────────────────────────────────────────────

/// Parse a CDMA SMS PDU.
///
/// Structural damage (a value shorter than its declared length, a field
/// running past its value) is fatal. Unknown parameter IDs and unsupported
/// encodings are skipped with a diagnostic, and missing mandatory
/// parameters produce a partially-populated part rather than an error.
pub fn parse(pdu: &[u8]) -> Result<SmsPart, Error> {
    let Some(&type_byte) = pdu.first() else {
        return Err(Error::MalformedPdu("empty PDU"));
    };
    let Some(message_type) = MessageType::from_u8(type_byte) else {
        return Err(Error::MalformedPdu("unknown message type"));
    };

    let mut part = SmsPart {
        message_type,
        ..SmsPart::default()
    };

    let mut cursor = 1;
    while cursor < pdu.len() {
        if cursor + 2 > pdu.len() {
            return Err(Error::MalformedPdu("truncated parameter header"));
        }
        let id = pdu[cursor];
        let len = usize::from(pdu[cursor + 1]);
        let value = pdu
            .get(cursor + 2..cursor + 2 + len)
            .ok_or(Error::MalformedPdu("parameter value past end of PDU"))?;

        match id {
            PARAM_TELESERVICE_ID => {
                if let Some(v) = read_u16_param(value, "teleservice id") {
                    part.teleservice = Some(Teleservice::from_u16(v));
                }
            }
            PARAM_SERVICE_CATEGORY => {
                part.service_category = read_u16_param(value, "service category");
            }
            PARAM_ORIGINATING_ADDRESS | PARAM_DESTINATION_ADDRESS => {
                part.number = Some(read_address(value)?);
            }
            PARAM_ORIGINATING_SUBADDRESS | PARAM_DESTINATION_SUBADDRESS => {
                debug!("skipping subaddress parameter ({len} bytes)");
            }
            PARAM_BEARER_REPLY_OPTION => {
                let mut r = BitReader::new(value);
                part.reply_sequence = Some(r.read(6)? as u8);
            }
            PARAM_CAUSE_CODES => read_cause_codes(value, &mut part)?,
            PARAM_BEARER_DATA => read_bearer_data(value, &mut part)?,
            other => debug!("unknown parameter id {other:#04x}, skipping"),
        }
        cursor += 2 + len;
    }

    check_mandatory(&part);
    Ok(part)
}

fn read_u16_param(value: &[u8], what: &str) -> Option<u16> {
    if let [hi, lo] = value {
        Some(u16::from_be_bytes([*hi, *lo]))
    } else {
        debug!("{what} parameter has bad length {}, skipping", value.len());
        None
    }
}

/// DTMF digit table: 1-9 direct, 10 = `0`, 11 = `*`, 12 = `#`.
fn dtmf_to_char(digit: u8) -> Option<char> {
    match digit {
        1..=9 => Some(char::from(b'0' + digit)),
        10 => Some('0'),
        11 => Some('*'),
        12 => Some('#'),
        _ => None,
    }
}

fn char_to_dtmf(c: char) -> Option<u8> {
    match c {
        '1'..='9' => Some(c as u8 - b'0'),
        '0' => Some(10),
        '*' => Some(11),
        '#' => Some(12),
        _ => None,
    }
}

fn read_address(value: &[u8]) -> Result<String, Error> {
    let mut r = BitReader::new(value);
    let digit_mode = r.read(1)?;
    let _number_mode = r.read(1)?;
    let mut international = false;
    if digit_mode == DIGIT_MODE_ASCII {
        let number_type = r.read(3)?;
        let _numbering_plan = r.read(4)?;
        international = number_type == NUMBER_TYPE_INTERNATIONAL;
    }
    let num_fields = r.read(8)?;

    let mut number = String::with_capacity(usize::from(num_fields) + 1);
    if international {
        number.push('+');
    }
    for _ in 0..num_fields {
        if digit_mode == DIGIT_MODE_DTMF {
            let digit = r.read(4)? as u8;
            match dtmf_to_char(digit) {
                Some(c) => number.push(c),
                None => debug!("invalid DTMF digit {digit}, skipping"),
            }
        } else {
            number.push(char::from(r.read(8)? as u8));
        }
    }
    Ok(number)
}

fn read_cause_codes(value: &[u8], part: &mut SmsPart) -> Result<(), Error> {
    let mut r = BitReader::new(value);
    part.reply_sequence = Some(r.read(6)? as u8);
    let class = r.read(2)?;
    part.delivery_state = match class {
        0 => Some(DeliveryState::COMPLETED_RECEIVED),
        2 => Some(DeliveryState::from_cause(true, r.read(8)? as u8)),
        3 => Some(DeliveryState::from_cause(false, r.read(8)? as u8)),
        reserved => {
            debug!("reserved error class {reserved}, no delivery state");
            None
        }
    };
    Ok(())
}

fn read_bearer_data(value: &[u8], part: &mut SmsPart) -> Result<(), Error> {
    let mut cursor = 0;
    while cursor < value.len() {
        if cursor + 2 > value.len() {
            return Err(Error::MalformedPdu("truncated subparameter header"));
        }
        let id = value[cursor];
        let len = usize::from(value[cursor + 1]);
        let sub = value
            .get(cursor + 2..cursor + 2 + len)
            .ok_or(Error::MalformedPdu("subparameter value past end of bearer data"))?;

        match id {
            SUBPARAM_MESSAGE_ID => {
                let mut r = BitReader::new(sub);
                part.bearer_message_type = Some(BearerMessageType::from_u8(r.read(4)? as u8));
                part.message_id = Some(r.read(16)?);
            }
            SUBPARAM_USER_DATA => read_user_data(sub, part)?,
            other => debug!("unknown bearer subparameter {other:#04x}, skipping"),
        }
        cursor += 2 + len;
    }
    Ok(())
}

fn read_user_data(sub: &[u8], part: &mut SmsPart) -> Result<(), Error> {
    let mut r = BitReader::new(sub);
    let encoding = DataEncoding::from_u8(r.read(5)? as u8);
    // EPM and GSM-DCS carry an extra message-type octet before the count.
    if matches!(encoding, DataEncoding::Epm | DataEncoding::GsmDcs) {
        let _message_type = r.read(8)?;
    }
    let num_fields = usize::from(r.read(8)? as u8);

    match encoding {
        DataEncoding::Octet => {
            let mut data = Vec::with_capacity(num_fields);
            for _ in 0..num_fields {
                data.push(r.read(8)? as u8);
            }
            part.data = Some(data);
        }
        DataEncoding::Ascii7 | DataEncoding::Ia5 => {
            let mut text = String::with_capacity(num_fields);
            for _ in 0..num_fields {
                text.push(char::from(r.read(7)? as u8));
            }
            part.text = Some(text);
        }
        DataEncoding::Latin => {
            let mut text = String::with_capacity(num_fields);
            for _ in 0..num_fields {
                text.push(char::from(r.read(8)? as u8));
            }
            part.text = Some(text);
        }
        DataEncoding::Unicode => {
            let mut units = Vec::with_capacity(num_fields);
            for _ in 0..num_fields {
                units.push(r.read(16)?);
            }
            match String::from_utf16(&units) {
                Ok(text) => part.text = Some(text),
                Err(_) => {
                    debug!("unpaired surrogate in unicode user data, decoding lossily");
                    part.text = Some(String::from_utf16_lossy(&units));
                }
            }
        }
        unsupported => {
            debug!(
                "unsupported user-data encoding {unsupported:?}, ignoring {num_fields} fields"
            );
        }
    }
    Ok(())
}

/// Mandatory parameters differ by message type; a missing one is a
/// diagnostic, not a parse failure.
fn check_mandatory(part: &SmsPart) {
    match part.message_type {
        MessageType::PointToPoint => {
            if part.teleservice.is_none() {
                warn!("point-to-point message without teleservice id");
            }
        }
        MessageType::Broadcast => {
            if part.service_category.is_none() {
                warn!("broadcast message without service category");
            }
        }
        MessageType::Acknowledge => {
            if part.delivery_state.is_none() {
                warn!("acknowledge message without cause codes");
            }
        }
    }
}

// ── Encode ───────────────────────────────────────────────────────────

/// Encode a submit PDU. Only the WMT teleservice is supported; anything
/// else is a hard error since we fully control the encode path.
pub fn encode_submit(part: &SmsPart) -> Result<Vec<u8>, Error> {
    match part.teleservice {
        Some(Teleservice::Wmt) | None => {}
        Some(other) => return Err(Error::UnsupportedTeleservice(other.as_u16())),
    }
    let number = part
        .number
        .as_deref()
        .ok_or(Error::MalformedPdu("submit requires a destination number"))?;

    let mut out = vec![MessageType::PointToPoint.as_u8()];

    out.push(PARAM_TELESERVICE_ID);
    out.push(2);
    out.extend_from_slice(&Teleservice::Wmt.as_u16().to_be_bytes());

    let address = encode_address(number)?;
    push_record(&mut out, PARAM_DESTINATION_ADDRESS, &address, "address")?;

    let bearer = encode_bearer_data(part)?;
    push_record(&mut out, PARAM_BEARER_DATA, &bearer, "bearer data")?;

    Ok(out)
}

fn push_record(out: &mut Vec<u8>, id: u8, value: &[u8], what: &'static str) -> Result<(), Error> {
    if value.len() > MAX_FIELDS {
        return Err(Error::TooLong {
            what,
            len: value.len(),
            max: MAX_FIELDS,
        });
    }
    out.push(id);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    Ok(())
}

/// ASCII digit mode for international (`+`-prefixed) numbers, packed DTMF
/// otherwise.
fn encode_address(number: &str) -> Result<Vec<u8>, Error> {
    let mut w = BitWriter::new();
    if let Some(digits) = number.strip_prefix('+') {
        if digits.len() > MAX_FIELDS {
            return Err(Error::TooLong {
                what: "address",
                len: digits.len(),
                max: MAX_FIELDS,
            });
        }
        w.put(DIGIT_MODE_ASCII, 1);
        w.put(0, 1); // number mode: digits
        w.put(NUMBER_TYPE_INTERNATIONAL, 3);
        w.put(NUMBERING_PLAN_ISDN, 4);
        w.put(digits.len() as u16, 8);
        for &b in digits.as_bytes() {
            w.put(u16::from(b), 8);
        }
    } else {
        if number.len() > MAX_FIELDS {
            return Err(Error::TooLong {
                what: "address",
                len: number.len(),
                max: MAX_FIELDS,
            });
        }
        w.put(DIGIT_MODE_DTMF, 1);
        w.put(0, 1);
        w.put(number.len() as u16, 8);
        for c in number.chars() {
            let digit = char_to_dtmf(c)
                .ok_or(Error::MalformedPdu("digit not representable in DTMF address"))?;
            w.put(u16::from(digit), 4);
        }
    }
    Ok(w.into_bytes())
}

/// Greedy encoding choice: 7-bit ASCII when everything fits, Latin-1 when
/// every character survives the single-byte charset, UTF-16 otherwise.
fn choose_encoding(text: &str) -> (DataEncoding, u8, Vec<u16>) {
    if text.chars().all(|c| (c as u32) < 0x80) {
        (DataEncoding::Ascii7, 7, text.chars().map(|c| c as u16).collect())
    } else if text.chars().all(|c| (c as u32) <= 0xff) {
        (DataEncoding::Latin, 8, text.chars().map(|c| c as u16).collect())
    } else {
        (DataEncoding::Unicode, 16, text.encode_utf16().collect())
    }
}

fn encode_bearer_data(part: &SmsPart) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();

    // Message identifier: type, 16-bit id, no header, 3 reserved bits.
    let mut w = BitWriter::new();
    w.put(2, 4); // submit
    w.put(part.message_id.unwrap_or(0), 16);
    w.put(0, 1);
    w.put(0, 3);
    push_record(&mut out, SUBPARAM_MESSAGE_ID, &w.into_bytes(), "message id")?;

    if let Some(text) = &part.text {
        let (encoding, width, units) = choose_encoding(text);
        if units.len() > MAX_FIELDS {
            return Err(Error::TooLong {
                what: "user data",
                len: units.len(),
                max: MAX_FIELDS,
            });
        }
        let mut w = BitWriter::new();
        w.put(u16::from(encoding.as_u8()), 5);
        w.put(units.len() as u16, 8);
        for unit in units {
            w.put(unit, width);
        }
        push_record(&mut out, SUBPARAM_USER_DATA, &w.into_bytes(), "user data")?;
    } else if let Some(data) = &part.data {
        if data.len() > MAX_FIELDS {
            return Err(Error::TooLong {
                what: "user data",
                len: data.len(),
                max: MAX_FIELDS,
            });
        }
        let mut w = BitWriter::new();
        w.put(u16::from(DataEncoding::Octet.as_u8()), 5);
        w.put(data.len() as u16, 8);
        for &b in data {
            w.put(u16::from(b), 8);
        }
        push_record(&mut out, SUBPARAM_USER_DATA, &w.into_bytes(), "user data")?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Point-to-point deliver: WMT, DTMF originating address "123", bearer
    /// data with message id 1 and 7-bit "Hi". Bytes hand-assembled from the
    /// C.S0015-B field layout.
    const DELIVER_PDU: &[u8] = &[
        0x00, // point-to-point
        0x00, 0x02, 0x10, 0x02, // teleservice: WMT
        0x02, 0x03, 0x00, 0xc4, 0x8c, // originating address "123" (DTMF)
        0x08, 0x0b, // bearer data, 11 bytes
        0x00, 0x03, 0x10, 0x00, 0x10, // message id: deliver, id 1
        0x01, 0x04, 0x10, 0x14, 0x8d, 0x20, // user data: ascii-7 "Hi"
    ];

    #[test]
    fn test_parse_deliver_pdu() {
        let part = parse(DELIVER_PDU).unwrap();
        assert_eq!(part.message_type, MessageType::PointToPoint);
        assert_eq!(part.teleservice, Some(Teleservice::Wmt));
        assert_eq!(part.number.as_deref(), Some("123"));
        assert_eq!(part.bearer_message_type, Some(BearerMessageType::Deliver));
        assert_eq!(part.message_id, Some(1));
        assert_eq!(part.text.as_deref(), Some("Hi"));
    }

    #[test]
    fn test_parse_acknowledge_with_cause_codes() {
        // Reply seq 5, temporary error class, cause 6 (reserved range).
        let pdu = [0x02, 0x07, 0x02, 0x16, 0x06];
        let part = parse(&pdu).unwrap();
        assert_eq!(part.message_type, MessageType::Acknowledge);
        assert_eq!(part.reply_sequence, Some(5));
        assert_eq!(part.delivery_state, Some(DeliveryState(0x305)));
    }

    #[test]
    fn test_parse_no_error_cause_is_completed() {
        // Error class 0 carries no cause octet.
        let pdu = [0x02, 0x07, 0x01, 0x14];
        let part = parse(&pdu).unwrap();
        assert_eq!(
            part.delivery_state,
            Some(DeliveryState::COMPLETED_RECEIVED)
        );
    }

    #[test]
    fn test_delivery_state_reserved_ranges() {
        // One case from each documented reserved sub-range, plus directs.
        assert_eq!(DeliveryState::from_cause(true, 6).0, 0x305);
        assert_eq!(DeliveryState::from_cause(true, 31).0, 0x305);
        assert_eq!(DeliveryState::from_cause(false, 45).0, 0x227);
        assert_eq!(DeliveryState::from_cause(false, 50).0, 0x224);
        assert_eq!(DeliveryState::from_cause(true, 70).0, 0x342);
        assert_eq!(DeliveryState::from_cause(true, 101).0, 0x364);
        assert_eq!(DeliveryState::from_cause(false, 200).0, 0x26b);
        // Direct mappings outside the reserved ranges.
        assert_eq!(DeliveryState::from_cause(false, 3).0, 0x203);
        assert_eq!(DeliveryState::from_cause(true, 33).0, 0x321);
        assert_eq!(DeliveryState::from_cause(false, 96).0, 0x260);
    }

    #[test]
    fn test_malformed_truncated_value() {
        // Declared 4-byte value, only 1 byte present.
        let pdu = [0x00, 0x00, 0x04, 0x10];
        assert!(matches!(parse(&pdu), Err(Error::MalformedPdu(_))));
    }

    #[test]
    fn test_unknown_parameter_skipped() {
        let mut pdu = vec![0x00, 0x55, 0x02, 0xde, 0xad];
        pdu.extend_from_slice(&[0x00, 0x02, 0x10, 0x02]);
        let part = parse(&pdu).unwrap();
        assert_eq!(part.teleservice, Some(Teleservice::Wmt));
    }

    #[test]
    fn test_missing_mandatory_is_permissive() {
        // Point-to-point with no teleservice id: logged, still returned.
        let part = parse(&[0x00]).unwrap();
        assert_eq!(part.message_type, MessageType::PointToPoint);
        assert!(part.teleservice.is_none());
    }

    #[test]
    fn test_round_trip_ascii() {
        let part = SmsPart {
            message_id: Some(42),
            ..SmsPart::submit("+15551234567", "Hello from the other side")
        };
        let decoded = parse(&encode_submit(&part).unwrap()).unwrap();
        assert_eq!(decoded.number.as_deref(), Some("+15551234567"));
        assert_eq!(decoded.text.as_deref(), Some("Hello from the other side"));
        assert_eq!(decoded.message_id, Some(42));
        assert_eq!(decoded.teleservice, Some(Teleservice::Wmt));
        assert_eq!(decoded.bearer_message_type, Some(BearerMessageType::Submit));
    }

    #[test]
    fn test_round_trip_latin1() {
        let part = SmsPart::submit("5551234", "café señor, ¿qué tal?");
        let decoded = parse(&encode_submit(&part).unwrap()).unwrap();
        assert_eq!(decoded.number.as_deref(), Some("5551234"));
        assert_eq!(decoded.text.as_deref(), Some("café señor, ¿qué tal?"));
    }

    #[test]
    fn test_round_trip_unicode() {
        let part = SmsPart::submit("+819012345678", "日本語のテキスト 😀");
        let decoded = parse(&encode_submit(&part).unwrap()).unwrap();
        assert_eq!(decoded.number.as_deref(), Some("+819012345678"));
        assert_eq!(decoded.text.as_deref(), Some("日本語のテキスト 😀"));
    }

    #[test]
    fn test_round_trip_octet_data() {
        let part = SmsPart {
            data: Some(vec![0x00, 0xff, 0x7f, 0x80, 0x01]),
            ..SmsPart::submit("5550001", "")
        };
        let part = SmsPart { text: None, ..part };
        let decoded = parse(&encode_submit(&part).unwrap()).unwrap();
        assert_eq!(decoded.data.as_deref(), Some(&[0x00, 0xff, 0x7f, 0x80, 0x01][..]));
    }

    #[test]
    fn test_greedy_encoding_choice() {
        assert_eq!(choose_encoding("plain ascii").0, DataEncoding::Ascii7);
        assert_eq!(choose_encoding("café").0, DataEncoding::Latin);
        assert_eq!(choose_encoding("日本語").0, DataEncoding::Unicode);
    }

    #[test]
    fn test_encode_rejects_non_wmt_teleservice() {
        let part = SmsPart {
            teleservice: Some(Teleservice::Vmn),
            ..SmsPart::submit("5551234", "hi")
        };
        assert_eq!(
            encode_submit(&part).unwrap_err(),
            Error::UnsupportedTeleservice(0x1003)
        );
    }

    #[test]
    fn test_encode_rejects_oversized_text() {
        let part = SmsPart::submit("5551234", "x".repeat(300));
        assert!(matches!(
            encode_submit(&part).unwrap_err(),
            Error::TooLong { what: "user data", .. }
        ));
    }

    #[test]
    fn test_encode_rejects_undialable_dtmf() {
        let part = SmsPart::submit("555-1234", "hi");
        assert!(matches!(
            encode_submit(&part).unwrap_err(),
            Error::MalformedPdu(_)
        ));
    }

    #[test]
    fn test_dtmf_digit_table() {
        for (c, d) in [('1', 1), ('9', 9), ('0', 10), ('*', 11), ('#', 12)] {
            assert_eq!(char_to_dtmf(c), Some(d));
            assert_eq!(dtmf_to_char(d), Some(c));
        }
        assert_eq!(char_to_dtmf('a'), None);
        assert_eq!(dtmf_to_char(0), None);
        assert_eq!(dtmf_to_char(15), None);
    }
}
