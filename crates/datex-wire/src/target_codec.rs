//! Inline target encoding
//!
//! Shared by the header (sender and receiver list) and the body (target
//! literals and filters):
//!
//! ```text
//! type        1B   endpoint kind (+1 = wildcard instance) or POINTER
//! name_len    1B
//! sub_count   1B
//! inst_len    1B   0 = any instance, 255 = empty instance
//! appspace    1B   0/1, appspace target follows the instance
//! name, subspaces (u8 len + bytes each), instance, [appspace]
//! ```
//!
//! Pointer targets are `POINTER` followed by the 26-byte id.

use bytes::BufMut;
use datex_core::{Clause, Cnf, DatexError, DatexResult, Endpoint, EndpointKind, Instance, Literal, Target};

use crate::{ByteReader, Opcode};

const INSTANCE_EMPTY: u8 = 255;

/// Clause count sentinel for the always-true filter
const CLAUSES_ALWAYS: u8 = 0xFF;

/// Type byte for an endpoint
pub fn endpoint_type_byte(endpoint: &Endpoint) -> u8 {
    let base = match endpoint.kind {
        EndpointKind::Person => Opcode::PERSON_ALIAS,
        EndpointKind::Institution => Opcode::INSTITUTION_ALIAS,
        EndpointKind::Bot => Opcode::BOT,
        EndpointKind::Id => Opcode::ENDPOINT,
    }
    .to_byte();
    match endpoint.instance {
        Instance::Any => base + 1,
        _ => base,
    }
}

fn kind_from_type_byte(b: u8) -> Option<EndpointKind> {
    match Opcode::from_byte(b)? {
        Opcode::PERSON_ALIAS | Opcode::PERSON_ALIAS_WILDCARD => Some(EndpointKind::Person),
        Opcode::INSTITUTION_ALIAS | Opcode::INSTITUTION_ALIAS_WILDCARD => Some(EndpointKind::Institution),
        Opcode::BOT | Opcode::BOT_WILDCARD => Some(EndpointKind::Bot),
        Opcode::ENDPOINT | Opcode::ENDPOINT_WILDCARD => Some(EndpointKind::Id),
        _ => None,
    }
}

fn short_len(s: &str, what: &str) -> DatexResult<u8> {
    if s.len() >= INSTANCE_EMPTY as usize {
        return Err(DatexError::Value(format!("{} too long: {} bytes", what, s.len())));
    }
    Ok(s.len() as u8)
}

/// Write an endpoint including its type byte
pub fn write_endpoint<B: BufMut>(buf: &mut B, endpoint: &Endpoint) -> DatexResult<()> {
    if endpoint.name.is_empty() {
        return Err(DatexError::Value("empty endpoint name".into()));
    }
    if endpoint.subspaces.len() > u8::MAX as usize {
        return Err(DatexError::Value("too many subspaces".into()));
    }
    let inst_len = match &endpoint.instance {
        Instance::Any => 0,
        Instance::Empty => INSTANCE_EMPTY,
        Instance::Named(i) if i.is_empty() => INSTANCE_EMPTY,
        Instance::Named(i) => short_len(i, "instance")?,
    };

    buf.put_u8(endpoint_type_byte(endpoint));
    buf.put_u8(short_len(&endpoint.name, "endpoint name")?);
    buf.put_u8(endpoint.subspaces.len() as u8);
    buf.put_u8(inst_len);
    buf.put_u8(endpoint.appspace.is_some() as u8);
    buf.put_slice(endpoint.name.as_bytes());
    for sub in &endpoint.subspaces {
        buf.put_u8(short_len(sub, "subspace")?);
        buf.put_slice(sub.as_bytes());
    }
    if let Instance::Named(i) = &endpoint.instance {
        buf.put_slice(i.as_bytes());
    }
    if let Some(app) = &endpoint.appspace {
        write_endpoint(buf, app)?;
    }
    Ok(())
}

/// Write any target including its type byte
pub fn write_target<B: BufMut>(buf: &mut B, target: &Target) -> DatexResult<()> {
    match target {
        Target::Endpoint(e) => write_endpoint(buf, e),
        Target::Pointer(id) => {
            buf.put_u8(Opcode::POINTER.to_byte());
            buf.put_slice(&id.to_bytes());
            Ok(())
        }
    }
}

/// Read an endpoint after its type byte has been consumed
pub fn read_endpoint(r: &mut ByteReader<'_>, type_byte: u8) -> DatexResult<Endpoint> {
    let kind = kind_from_type_byte(type_byte)
        .ok_or_else(|| DatexError::Syntax(format!("invalid target type 0x{:02x}", type_byte)))?;
    let name_len = r.u8()? as usize;
    let sub_count = r.u8()?;
    let inst_len = r.u8()?;
    let has_appspace = r.u8()? != 0;
    let name = r.text(name_len)?;
    let mut subspaces = Vec::with_capacity(sub_count as usize);
    for _ in 0..sub_count {
        subspaces.push(r.short_text()?);
    }
    let instance = match inst_len {
        0 => Instance::Any,
        INSTANCE_EMPTY => Instance::Empty,
        n => Instance::Named(r.text(n as usize)?),
    };
    let appspace = if has_appspace {
        let b = r.u8()?;
        Some(Box::new(read_endpoint(r, b)?))
    } else {
        None
    };
    Ok(Endpoint {
        kind,
        name,
        subspaces,
        instance,
        appspace,
    })
}

/// Read any target after its type byte has been consumed
pub fn read_target(r: &mut ByteReader<'_>, type_byte: u8) -> DatexResult<Target> {
    if type_byte == Opcode::POINTER.to_byte() {
        return Ok(Target::Pointer(r.pointer_id()?));
    }
    Ok(Target::Endpoint(read_endpoint(r, type_byte)?))
}

/// Sender field: a zero type byte means anonymous
pub fn write_sender<B: BufMut>(buf: &mut B, sender: Option<&Endpoint>) -> DatexResult<()> {
    match sender {
        Some(e) => write_endpoint(buf, e),
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

pub fn read_sender(r: &mut ByteReader<'_>) -> DatexResult<Option<Endpoint>> {
    match r.u8()? {
        0 => Ok(None),
        b => Ok(Some(read_endpoint(r, b)?)),
    }
}

/// Clause table over an indexed target list: `u8 clause count` (0xFF =
/// always), then per clause `u8 literal count` and one `i8` per literal
/// holding the 1-based target index, negative when negated
pub fn write_clause_table<B: BufMut>(buf: &mut B, cnf: &Cnf, targets: &[Target]) -> DatexResult<()> {
    if cnf.is_always() {
        buf.put_u8(CLAUSES_ALWAYS);
        return Ok(());
    }
    if targets.len() > i8::MAX as usize || cnf.len() >= CLAUSES_ALWAYS as usize {
        return Err(DatexError::Value("filter too large".into()));
    }
    buf.put_u8(cnf.len() as u8);
    for clause in cnf.clauses() {
        buf.put_u8(clause.literals().len() as u8);
        for lit in clause.literals() {
            let idx = targets
                .iter()
                .position(|t| *t == lit.target)
                .ok_or_else(|| DatexError::Value(format!("target {} not indexed", lit.target)))?
                as i8
                + 1;
            buf.put_i8(if lit.negated { -idx } else { idx });
        }
    }
    Ok(())
}

pub fn read_clause_table(r: &mut ByteReader<'_>, targets: &[Target]) -> DatexResult<Cnf> {
    let clause_count = r.u8()?;
    if clause_count == CLAUSES_ALWAYS {
        return Ok(Cnf::always());
    }
    let mut clauses = Vec::with_capacity(clause_count as usize);
    for _ in 0..clause_count {
        let n = r.u8()?;
        let mut lits = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let idx = r.i8()?;
            let target = (idx != 0)
                .then(|| targets.get(idx.unsigned_abs() as usize - 1))
                .flatten()
                .cloned()
                .ok_or_else(|| DatexError::Syntax(format!("invalid target index {}", idx)))?;
            lits.push(if idx < 0 {
                Literal::negative(target)
            } else {
                Literal::positive(target)
            });
        }
        clauses.push(Clause(lits));
    }
    Ok(Cnf::from_clauses(clauses))
}

/// Standalone filter: `u8 target count`, targets, clause table
pub fn write_filter<B: BufMut>(buf: &mut B, cnf: &Cnf) -> DatexResult<()> {
    let targets = cnf.targets();
    if targets.len() > i8::MAX as usize {
        return Err(DatexError::Value(format!("too many filter targets: {}", targets.len())));
    }
    buf.put_u8(targets.len() as u8);
    for t in &targets {
        write_target(buf, t)?;
    }
    write_clause_table(buf, cnf, &targets)
}

pub fn read_filter(r: &mut ByteReader<'_>) -> DatexResult<Cnf> {
    let count = r.u8()?;
    let mut targets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let b = r.u8()?;
        targets.push(read_target(r, b)?);
    }
    read_clause_table(r, &targets)
}
