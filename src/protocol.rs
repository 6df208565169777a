//! Matchmaking records and their stream wire codec.
//!
//! Three record types travel through the shared streams:
//!
//! - [`Ticket`]: a player's matchmaking request, decorated by the Director
//!   (global id, expiry) and the Matchmaker (failure count) as it moves.
//! - [`TicketMatch`]: a completed match referencing its participant tickets.
//! - Requirement/affinity submessages carried inside tickets.
//!
//! # Wire format
//!
//! Records are protobuf-wire-format messages (see [`crate::encode`] and
//! [`crate::parser`]). Field numbers are frozen; unknown fields are skipped
//! so rolling upgrades can add fields without breaking older readers.
//!
//! # Identity fields
//!
//! `global_id` is permanent. `state_id` identifies the stream entry the
//! record was last read from: the state store assigns it on every stream
//! write, so readers overwrite the embedded value with the entry id of the
//! read (see [`Ticket::with_state_id`]). Deleting "the ticket we just read"
//! always uses that entry id, never a stale embedded one.

use bytes::{BufMut, Bytes};
use chrono::Utc;
use nom::{IResult, InputLength};
use nombytes::NomBytes;

use crate::constants::MAX_WIRE_ARRAY_SIZE;
use crate::encode::{
    put_bool, put_float, put_int32, put_int64, put_message, put_packed_floats, put_string,
    put_uint32, ToWire, WIRE_FIXED32, WIRE_LEN, WIRE_VARINT,
};
use crate::error::{Error, Result};
use crate::parser::{
    parse_fixed32, parse_len_bytes, parse_len_string, parse_packed_floats, parse_tag, parse_varint,
    skip_value, varint_to_i32, varint_to_i64,
};
use crate::types::{GlobalId, PoolId, StateId};

/// Current UTC wall-clock in microseconds since the Unix epoch.
///
/// All record timestamps use this resolution; microseconds survive the
/// round-trip through the wire format exactly.
#[inline]
pub fn utc_now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Expiry value meaning "never expires" (`max_age_seconds == 0`).
pub const NEVER_EXPIRES: i64 = i64::MAX;

// =============================================================================
// Ticket
// =============================================================================

/// One individual requirement against another ticket's state vector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Requirement {
    /// Index into the other ticket's state vector.
    pub key: i32,
    /// Ranged (`values = [lo, hi]`) versus discreet (`values` is a whitelist).
    pub ranged: bool,
    pub values: Vec<f32>,
}

/// An any-of group of requirements. The group is satisfied when at least one
/// member requirement matches; a ticket is compatible only when every group
/// is satisfied, in both directions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequirementGroup {
    pub any: Vec<Requirement>,
}

/// A soft or hard preference compared pairwise by list position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Affinity {
    pub value: f32,
    /// Difference at which the normalized distance saturates.
    pub max_margin: f32,
    /// Prefer candidates far from `value` instead of close to it.
    pub prefer_disimilar: bool,
    /// Soft affinities only bias the rating; hard ones veto at the margin.
    pub soft_margin: bool,
    /// Weight of this affinity's contribution to the rating.
    pub priority_factor: f32,
}

/// A matchmaking ticket.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ticket {
    /// Stream-entry id of the last read; reassigned on every stream write.
    pub state_id: StateId,
    /// Permanent ticket identity.
    pub global_id: GlobalId,
    /// Creation time, UTC microseconds.
    pub timestamp: i64,
    /// Zero means the ticket never expires.
    pub max_age_seconds: u32,
    /// Pool namespace; empty is the default pool.
    pub pool_id: PoolId,
    /// Ordered state vectors, indexed by requirement keys.
    pub state: Vec<Vec<f32>>,
    pub requirements: Vec<RequirementGroup>,
    pub affinities: Vec<Affinity>,
    pub priority_base: i32,
    pub age_priority_factor: f32,
    /// Expiry deadline on the assigned matchmaker's clock, UTC microseconds.
    /// Set by the Director at assignment; [`NEVER_EXPIRES`] when ageless.
    pub expiry_matchmaker: i64,
    /// Failed matching rounds so far; advanced by the matchmaker.
    pub matching_failure_count: u32,
}

impl Ticket {
    /// A fresh ticket for the given pool, stamped with the current time.
    pub fn new(pool_id: PoolId) -> Self {
        Ticket {
            timestamp: utc_now_micros(),
            pool_id,
            ..Default::default()
        }
    }

    /// Replace the embedded state id with the stream entry id it was read
    /// from.
    pub fn with_state_id(mut self, state_id: StateId) -> Self {
        self.state_id = state_id;
        self
    }

    /// Age of the ticket relative to `now_micros`, in seconds.
    pub fn age_seconds(&self, now_micros: i64) -> f64 {
        (now_micros - self.timestamp) as f64 / 1_000_000.0
    }

    /// Whether the ticket is past its own max age (Director-side check,
    /// against the ticket's creation clock).
    pub fn is_past_max_age(&self, now_micros: i64) -> bool {
        self.max_age_seconds != 0 && self.age_seconds(now_micros) > f64::from(self.max_age_seconds)
    }

    /// Whether the ticket is past its matchmaker-clock expiry, with the
    /// given tolerance (matchmaker-side check).
    pub fn is_expired_on_matchmaker(&self, now_micros: i64, tolerance_micros: i64) -> bool {
        self.expiry_matchmaker != NEVER_EXPIRES
            && now_micros > self.expiry_matchmaker.saturating_add(tolerance_micros)
    }

    /// Reject tickets whose float payloads would poison rating arithmetic.
    ///
    /// A single NaN in a state vector or affinity propagates into candidate
    /// ratings and breaks the ordering invariants of the slot array, so
    /// non-finite values are refused at the door.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (i, entry) in self.state.iter().enumerate() {
            if entry.iter().any(|v| !v.is_finite()) {
                return Err(format!("state[{i}] contains a non-finite value"));
            }
        }
        for (i, group) in self.requirements.iter().enumerate() {
            for req in &group.any {
                if req.key < 0 {
                    return Err(format!("requirements[{i}] has a negative key"));
                }
                if req.values.iter().any(|v| !v.is_finite()) {
                    return Err(format!("requirements[{i}] contains a non-finite value"));
                }
            }
        }
        for (i, aff) in self.affinities.iter().enumerate() {
            if ![aff.value, aff.max_margin, aff.priority_factor]
                .iter()
                .all(|v| v.is_finite())
            {
                return Err(format!("affinities[{i}] contains a non-finite value"));
            }
        }
        if !self.age_priority_factor.is_finite() {
            return Err("age_priority_factor is not finite".to_string());
        }
        Ok(())
    }

    /// Decode a ticket from a stream payload.
    pub fn from_wire(data: &Bytes) -> Result<Ticket> {
        let input = NomBytes::new(data.clone());
        let (rest, ticket) = parse_ticket(input).map_err(wire_error("ticket"))?;
        if rest.input_len() != 0 {
            return Err(Error::Parse("trailing bytes after ticket".to_string()));
        }
        Ok(ticket)
    }
}

impl ToWire for Ticket {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        put_string(buffer, 1, self.state_id.as_str());
        if !self.global_id.is_nil() {
            put_string(buffer, 2, &self.global_id.to_string());
        }
        put_int64(buffer, 3, self.timestamp);
        put_uint32(buffer, 4, self.max_age_seconds);
        put_string(buffer, 5, self.pool_id.as_str());
        for entry in &self.state {
            put_message(buffer, 6, &FloatArray(entry))?;
        }
        for group in &self.requirements {
            put_message(buffer, 7, group)?;
        }
        for affinity in &self.affinities {
            put_message(buffer, 8, affinity)?;
        }
        put_int32(buffer, 9, self.priority_base);
        put_float(buffer, 10, self.age_priority_factor);
        put_int64(buffer, 11, self.expiry_matchmaker);
        put_uint32(buffer, 12, self.matching_failure_count);
        Ok(())
    }
}

/// Wire wrapper for one state vector: `repeated float values = 1`, packed.
struct FloatArray<'a>(&'a [f32]);

impl ToWire for FloatArray<'_> {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        put_packed_floats(buffer, 1, self.0);
        Ok(())
    }
}

impl ToWire for RequirementGroup {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        for req in &self.any {
            put_message(buffer, 1, req)?;
        }
        Ok(())
    }
}

impl ToWire for Requirement {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        put_int32(buffer, 1, self.key);
        put_bool(buffer, 2, self.ranged);
        put_packed_floats(buffer, 3, &self.values);
        Ok(())
    }
}

impl ToWire for Affinity {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        put_float(buffer, 1, self.value);
        put_float(buffer, 2, self.max_margin);
        put_bool(buffer, 3, self.prefer_disimilar);
        put_bool(buffer, 4, self.soft_margin);
        put_float(buffer, 5, self.priority_factor);
        Ok(())
    }
}

// =============================================================================
// TicketMatch
// =============================================================================

/// A completed match: the owning ticket first, then the picked candidates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TicketMatch {
    /// Stream-entry id of the last read, as for tickets.
    pub state_id: StateId,
    /// Permanent match identity, assigned by the matchmaker at formation.
    pub global_id: GlobalId,
    /// Participant ticket ids; the first entry is the owning ticket.
    pub ticket_ids: Vec<GlobalId>,
}

impl TicketMatch {
    /// Form a new match. The owner leads the participant list.
    pub fn form(owner: GlobalId, picked: impl IntoIterator<Item = GlobalId>) -> Self {
        let mut ticket_ids = vec![owner];
        ticket_ids.extend(picked);
        TicketMatch {
            state_id: StateId::default(),
            global_id: GlobalId::random(),
            ticket_ids,
        }
    }

    /// Replace the embedded state id with the stream entry id it was read
    /// from.
    pub fn with_state_id(mut self, state_id: StateId) -> Self {
        self.state_id = state_id;
        self
    }

    /// Decode a match from a stream payload.
    pub fn from_wire(data: &Bytes) -> Result<TicketMatch> {
        let input = NomBytes::new(data.clone());
        let (rest, m) = parse_ticket_match(input).map_err(wire_error("match"))?;
        if rest.input_len() != 0 {
            return Err(Error::Parse("trailing bytes after match".to_string()));
        }
        Ok(m)
    }
}

impl ToWire for TicketMatch {
    fn encode<B: BufMut>(&self, buffer: &mut B) -> Result<()> {
        put_string(buffer, 1, self.state_id.as_str());
        if !self.global_id.is_nil() {
            put_string(buffer, 2, &self.global_id.to_string());
        }
        for id in &self.ticket_ids {
            put_string(buffer, 3, &id.to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Parsers
// =============================================================================

fn wire_error(what: &'static str) -> impl Fn(nom::Err<nom::error::Error<NomBytes>>) -> Error {
    move |e| Error::Parse(format!("malformed {what}: {e:?}"))
}

fn too_large(s: NomBytes) -> nom::Err<nom::error::Error<NomBytes>> {
    nom::Err::Failure(nom::error::Error::new(s, nom::error::ErrorKind::TooLarge))
}

fn verify_err(s: NomBytes) -> nom::Err<nom::error::Error<NomBytes>> {
    nom::Err::Failure(nom::error::Error::new(s, nom::error::ErrorKind::Verify))
}

fn parse_global_id(s: NomBytes) -> IResult<NomBytes, GlobalId> {
    let (s, text) = parse_len_string(s)?;
    match GlobalId::parse(&text) {
        Some(id) => Ok((s, id)),
        None => Err(verify_err(s)),
    }
}

fn parse_ticket(mut input: NomBytes) -> IResult<NomBytes, Ticket> {
    let mut ticket = Ticket::default();

    while input.input_len() != 0 {
        let (rest, (field, wire)) = parse_tag(input)?;
        input = match (field, wire) {
            (1, WIRE_LEN) => {
                let (rest, text) = parse_len_string(rest)?;
                ticket.state_id = StateId::new(text);
                rest
            }
            (2, WIRE_LEN) => {
                let (rest, id) = parse_global_id(rest)?;
                ticket.global_id = id;
                rest
            }
            (3, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                ticket.timestamp = varint_to_i64(raw);
                rest
            }
            (4, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                ticket.max_age_seconds = raw as u32;
                rest
            }
            (5, WIRE_LEN) => {
                let (rest, text) = parse_len_string(rest)?;
                ticket.pool_id = PoolId::new(text);
                rest
            }
            (6, WIRE_LEN) => {
                if ticket.state.len() >= MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                let (rest, body) = parse_len_bytes(rest)?;
                let (_, values) = parse_float_array(NomBytes::new(body))?;
                ticket.state.push(values);
                rest
            }
            (7, WIRE_LEN) => {
                if ticket.requirements.len() >= MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                let (rest, body) = parse_len_bytes(rest)?;
                let (_, group) = parse_requirement_group(NomBytes::new(body))?;
                ticket.requirements.push(group);
                rest
            }
            (8, WIRE_LEN) => {
                if ticket.affinities.len() >= MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                let (rest, body) = parse_len_bytes(rest)?;
                let (_, affinity) = parse_affinity(NomBytes::new(body))?;
                ticket.affinities.push(affinity);
                rest
            }
            (9, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                ticket.priority_base = varint_to_i32(raw);
                rest
            }
            (10, WIRE_FIXED32) => {
                let (rest, v) = parse_fixed32(rest)?;
                ticket.age_priority_factor = v;
                rest
            }
            (11, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                ticket.expiry_matchmaker = varint_to_i64(raw);
                rest
            }
            (12, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                ticket.matching_failure_count = raw as u32;
                rest
            }
            (_, wire) => {
                let (rest, ()) = skip_value(rest, wire)?;
                rest
            }
        };
    }

    Ok((input, ticket))
}

fn parse_float_array(mut input: NomBytes) -> IResult<NomBytes, Vec<f32>> {
    let mut values = Vec::new();

    while input.input_len() != 0 {
        let (rest, (field, wire)) = parse_tag(input)?;
        input = match (field, wire) {
            (1, WIRE_LEN) => {
                let (rest, body) = parse_len_bytes(rest)?;
                let mut packed = parse_packed_floats(&body)?;
                if values.len() + packed.len() > MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                values.append(&mut packed);
                rest
            }
            // Unpacked encoding of the same field, element at a time.
            (1, WIRE_FIXED32) => {
                let (rest, v) = parse_fixed32(rest)?;
                if values.len() >= MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                values.push(v);
                rest
            }
            (_, wire) => {
                let (rest, ()) = skip_value(rest, wire)?;
                rest
            }
        };
    }

    Ok((input, values))
}

fn parse_requirement_group(mut input: NomBytes) -> IResult<NomBytes, RequirementGroup> {
    let mut group = RequirementGroup::default();

    while input.input_len() != 0 {
        let (rest, (field, wire)) = parse_tag(input)?;
        input = match (field, wire) {
            (1, WIRE_LEN) => {
                if group.any.len() >= MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                let (rest, body) = parse_len_bytes(rest)?;
                let (_, req) = parse_requirement(NomBytes::new(body))?;
                group.any.push(req);
                rest
            }
            (_, wire) => {
                let (rest, ()) = skip_value(rest, wire)?;
                rest
            }
        };
    }

    Ok((input, group))
}

fn parse_requirement(mut input: NomBytes) -> IResult<NomBytes, Requirement> {
    let mut req = Requirement::default();

    while input.input_len() != 0 {
        let (rest, (field, wire)) = parse_tag(input)?;
        input = match (field, wire) {
            (1, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                req.key = varint_to_i32(raw);
                rest
            }
            (2, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                req.ranged = raw != 0;
                rest
            }
            (3, WIRE_LEN) => {
                let (rest, body) = parse_len_bytes(rest)?;
                let mut packed = parse_packed_floats(&body)?;
                if req.values.len() + packed.len() > MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                req.values.append(&mut packed);
                rest
            }
            (3, WIRE_FIXED32) => {
                let (rest, v) = parse_fixed32(rest)?;
                req.values.push(v);
                rest
            }
            (_, wire) => {
                let (rest, ()) = skip_value(rest, wire)?;
                rest
            }
        };
    }

    Ok((input, req))
}

fn parse_affinity(mut input: NomBytes) -> IResult<NomBytes, Affinity> {
    let mut affinity = Affinity::default();

    while input.input_len() != 0 {
        let (rest, (field, wire)) = parse_tag(input)?;
        input = match (field, wire) {
            (1, WIRE_FIXED32) => {
                let (rest, v) = parse_fixed32(rest)?;
                affinity.value = v;
                rest
            }
            (2, WIRE_FIXED32) => {
                let (rest, v) = parse_fixed32(rest)?;
                affinity.max_margin = v;
                rest
            }
            (3, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                affinity.prefer_disimilar = raw != 0;
                rest
            }
            (4, WIRE_VARINT) => {
                let (rest, raw) = parse_varint(rest)?;
                affinity.soft_margin = raw != 0;
                rest
            }
            (5, WIRE_FIXED32) => {
                let (rest, v) = parse_fixed32(rest)?;
                affinity.priority_factor = v;
                rest
            }
            (_, wire) => {
                let (rest, ()) = skip_value(rest, wire)?;
                rest
            }
        };
    }

    Ok((input, affinity))
}

fn parse_ticket_match(mut input: NomBytes) -> IResult<NomBytes, TicketMatch> {
    let mut m = TicketMatch::default();

    while input.input_len() != 0 {
        let (rest, (field, wire)) = parse_tag(input)?;
        input = match (field, wire) {
            (1, WIRE_LEN) => {
                let (rest, text) = parse_len_string(rest)?;
                m.state_id = StateId::new(text);
                rest
            }
            (2, WIRE_LEN) => {
                let (rest, id) = parse_global_id(rest)?;
                m.global_id = id;
                rest
            }
            (3, WIRE_LEN) => {
                if m.ticket_ids.len() >= MAX_WIRE_ARRAY_SIZE {
                    return Err(too_large(rest));
                }
                let (rest, id) = parse_global_id(rest)?;
                m.ticket_ids.push(id);
                rest
            }
            (_, wire) => {
                let (rest, ()) = skip_value(rest, wire)?;
                rest
            }
        };
    }

    Ok((input, m))
}
