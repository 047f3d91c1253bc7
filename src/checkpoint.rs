//! Checkpoint wire codec (`spec.md` §4.7).
//!
//! Exact binary layout: 4-byte magic `JCK0`, 2-byte version, 16-byte
//! instance UUID, 4-byte monotonically increasing checkpoint sequence id,
//! a sequence of length-prefixed TLV sections, then a trailing 4-byte
//! CRC32 over everything before it. Grounded on the teacher's own
//! snapshot codec shape (magic + version + checksum-trailer framing);
//! `crc32fast` is the pack's established crate for this exact need.
//!
//! `encode(decode(x)) == x` byte-exact is not guaranteed (map/instance
//! field order is not meaningful); `decode(encode(x))` only needs to be
//! observationally equivalent, which is what `ContinuationNode`-level
//! encoding below provides.

use std::{collections::HashMap, rc::Rc};

use crc32fast::Hasher as Crc32;
use uuid::Uuid;

use crate::{
    bytecode::vm::CodeRef,
    class::ClassId,
    continuation::ContinuationNode,
    decimal::Decimal,
    error::{RunResult, RuntimeError, RuntimeErrorKind},
    value::{Instance, MapKey, Value},
};

const MAGIC: [u8; 4] = *b"JCK0";
const VERSION: u16 = 1;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_BYTE: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_LONG: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_DECIMAL: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_LIST: u8 = 8;
const TAG_MAP: u8 = 9;
const TAG_INSTANCE: u8 = 10;
const TAG_FUNCTION_REF: u8 = 11;
const TAG_ITERATOR_STATE: u8 = 12;

const SECTION_GLOBALS: u8 = 1;
const SECTION_CONTEXT_ID: u8 = 2;
const SECTION_CLASS_VERSION_DIGEST: u8 = 3;
const SECTION_FRAMES: u8 = 4;

fn restore_err(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::RestoreError, msg, "<checkpoint>", 0)
}

fn checkpoint_err(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::CheckpointError, msg, "<checkpoint>", 0)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_bits().to_le_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }
    fn str(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
    fn take(&mut self, n: usize) -> RunResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(restore_err("checkpoint buffer truncated"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
    fn u8(&mut self) -> RunResult<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> RunResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> RunResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> RunResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> RunResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> RunResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn f64(&mut self) -> RunResult<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.take(8)?.try_into().unwrap())))
    }
    fn bytes(&mut self) -> RunResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
    fn str(&mut self) -> RunResult<String> {
        String::from_utf8(self.bytes()?.to_vec()).map_err(|e| restore_err(e.to_string()))
    }
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Identity of a heap-allocated value, used only to detect cycles along
/// the current encode path — not a full object-graph dedup table, since
/// the wire format doesn't share structure across checkpoints.
fn heap_identity(v: &Value) -> Option<usize> {
    match v {
        Value::List(l) => Some(Rc::as_ptr(l) as usize),
        Value::Map(m) => Some(Rc::as_ptr(m) as usize),
        Value::Instance(inst) => Some(Rc::as_ptr(&inst.fields) as usize),
        Value::Closure(c) => Some(Rc::as_ptr(c) as usize),
        _ => None,
    }
}

fn encode_value(w: &mut Writer, v: &Value, visiting: &mut Vec<usize>) -> RunResult<()> {
    if let Some(id) = heap_identity(v) {
        if visiting.contains(&id) {
            return Err(checkpoint_err("cyclic value graph cannot be checkpointed"));
        }
        visiting.push(id);
    }
    match v {
        Value::Null => w.u8(TAG_NULL),
        Value::Boolean(b) => {
            w.u8(TAG_BOOL);
            w.u8(u8::from(*b));
        }
        Value::Byte(b) => {
            w.u8(TAG_BYTE);
            w.u8(*b);
        }
        Value::Int(i) => {
            w.u8(TAG_INT);
            w.i32(*i);
        }
        Value::Long(l) => {
            w.u8(TAG_LONG);
            w.i64(*l);
        }
        Value::Double(d) => {
            w.u8(TAG_DOUBLE);
            w.f64(*d);
        }
        Value::Decimal(d) => {
            w.u8(TAG_DECIMAL);
            w.str(&d.to_string());
        }
        Value::Str(s) => {
            w.u8(TAG_STRING);
            w.str(s);
        }
        Value::List(l) => {
            w.u8(TAG_LIST);
            let items = l.borrow();
            w.u32(items.len() as u32);
            for item in items.iter() {
                encode_value(w, item, visiting)?;
            }
        }
        Value::Map(m) => {
            w.u8(TAG_MAP);
            let entries = m.borrow();
            w.u32(entries.len() as u32);
            for (k, val) in entries.iter() {
                encode_value(w, &k.0, visiting)?;
                encode_value(w, val, visiting)?;
            }
        }
        Value::Instance(inst) => {
            w.u8(TAG_INSTANCE);
            w.u32(inst.class.0);
            let fields = inst.fields.borrow();
            w.u32(fields.len() as u32);
            for f in fields.iter() {
                encode_value(w, f, visiting)?;
            }
        }
        Value::Closure(c) => {
            w.u8(TAG_FUNCTION_REF);
            w.u32(c.function_id);
            w.u32(c.captures.len() as u32);
            for cell in &c.captures {
                encode_value(w, &cell.borrow(), visiting)?;
            }
        }
    }
    if heap_identity(v).is_some() {
        visiting.pop();
    }
    Ok(())
}

fn decode_value(r: &mut Reader) -> RunResult<Value> {
    let tag = r.u8()?;
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Boolean(r.u8()? != 0),
        TAG_BYTE => Value::Byte(r.u8()?),
        TAG_INT => Value::Int(r.i32()?),
        TAG_LONG => Value::Long(r.i64()?),
        TAG_DOUBLE => Value::Double(r.f64()?),
        TAG_DECIMAL => {
            let s = r.str()?;
            Value::Decimal(Rc::new(s.parse::<Decimal>().map_err(|_| restore_err("malformed Decimal in checkpoint"))?))
        }
        TAG_STRING => Value::Str(Rc::from(r.str()?.as_str())),
        TAG_LIST => {
            let n = r.u32()?;
            let mut items = Vec::with_capacity(n as usize);
            for _ in 0..n {
                items.push(decode_value(r)?);
            }
            Value::List(Rc::new(std::cell::RefCell::new(items)))
        }
        TAG_MAP => {
            let n = r.u32()?;
            let mut map = indexmap::IndexMap::new();
            for _ in 0..n {
                let k = decode_value(r)?;
                let v = decode_value(r)?;
                map.insert(MapKey(k), v);
            }
            Value::Map(Rc::new(std::cell::RefCell::new(map)))
        }
        TAG_INSTANCE => {
            let class = ClassId(r.u32()?);
            let n = r.u32()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                fields.push(decode_value(r)?);
            }
            Value::Instance(Instance { class, fields: Rc::new(std::cell::RefCell::new(fields)) })
        }
        TAG_FUNCTION_REF => {
            let function_id = r.u32()?;
            let n = r.u32()?;
            let mut captures = Vec::with_capacity(n as usize);
            for _ in 0..n {
                captures.push(Rc::new(std::cell::RefCell::new(decode_value(r)?)));
            }
            Value::Closure(Rc::new(crate::value::ClosureValue { function_id, captures }))
        }
        TAG_ITERATOR_STATE => return Err(restore_err("ITERATOR_STATE is reserved; this crate never produces one")),
        other => return Err(restore_err(format!("unknown value tag {other} in checkpoint"))),
    })
}

fn encode_code_ref(w: &mut Writer, code_ref: CodeRef) {
    match code_ref {
        CodeRef::Main => {
            w.u8(0);
            w.u32(0);
        }
        CodeRef::Function(id) => {
            w.u8(1);
            w.u32(id);
        }
        CodeRef::NativeIter(kind) => {
            w.u8(2);
            w.u32(u32::from(kind.to_u8()));
        }
    }
}

fn decode_code_ref(r: &mut Reader) -> RunResult<CodeRef> {
    let tag = r.u8()?;
    let raw = r.u32()?;
    Ok(match tag {
        0 => CodeRef::Main,
        1 => CodeRef::Function(raw),
        2 => CodeRef::NativeIter(crate::bytecode::vm::NativeIterKind::from_u8(raw as u8).ok_or_else(|| restore_err("unknown native-iter kind in checkpoint"))?),
        other => return Err(restore_err(format!("unknown code-ref tag {other} in checkpoint"))),
    })
}

fn encode_node(w: &mut Writer, node: &ContinuationNode) -> RunResult<()> {
    encode_code_ref(w, node.code_ref);
    w.u32(node.method_location);
    let mut visiting = Vec::new();
    w.u32(node.locals.len() as u32);
    for v in &node.locals {
        encode_value(w, v, &mut visiting)?;
    }
    w.u32(node.captures.len() as u32);
    for v in &node.captures {
        encode_value(w, v, &mut visiting)?;
    }
    w.u32(node.operand_stack.len() as u32);
    for v in &node.operand_stack {
        encode_value(w, v, &mut visiting)?;
    }
    Ok(())
}

fn decode_node(r: &mut Reader) -> RunResult<ContinuationNode> {
    let code_ref = decode_code_ref(r)?;
    let method_location = r.u32()?;
    let n_locals = r.u32()?;
    let locals = (0..n_locals).map(|_| decode_value(r)).collect::<RunResult<Vec<_>>>()?;
    let n_captures = r.u32()?;
    let captures = (0..n_captures).map(|_| decode_value(r)).collect::<RunResult<Vec<_>>>()?;
    let n_stack = r.u32()?;
    let operand_stack = (0..n_stack).map(|_| decode_value(r)).collect::<RunResult<Vec<_>>>()?;
    Ok(ContinuationNode { code_ref, method_location, locals, captures, operand_stack })
}

fn write_section(w: &mut Writer, tag: u8, body: impl FnOnce(&mut Writer) -> RunResult<()>) -> RunResult<()> {
    w.u8(tag);
    let mut inner = Writer::new();
    body(&mut inner)?;
    w.bytes(&inner.buf);
    Ok(())
}

/// Encodes a checkpoint: instance identity, the host's class-schema digest
/// (decode fails loudly if it doesn't match at restore time), the script's
/// globals snapshot, and the suspended frame chain, outer-most first.
pub fn encode(
    instance_id: Uuid,
    checkpoint_id: u32,
    context_id: u32,
    class_version_digest: u32,
    globals: &HashMap<String, Value>,
    frames: &[ContinuationNode],
) -> RunResult<Vec<u8>> {
    let mut w = Writer::new();
    w.buf.extend_from_slice(&MAGIC);
    w.u16(VERSION);
    w.buf.extend_from_slice(instance_id.as_bytes());
    w.u32(checkpoint_id);

    write_section(&mut w, SECTION_CONTEXT_ID, |w| {
        w.u32(context_id);
        Ok(())
    })?;
    write_section(&mut w, SECTION_CLASS_VERSION_DIGEST, |w| {
        w.u32(class_version_digest);
        Ok(())
    })?;
    write_section(&mut w, SECTION_GLOBALS, |w| {
        w.u32(globals.len() as u32);
        let mut visiting = Vec::new();
        for (name, value) in globals {
            w.str(name);
            encode_value(w, value, &mut visiting)?;
        }
        Ok(())
    })?;
    write_section(&mut w, SECTION_FRAMES, |w| {
        w.u32(frames.len() as u32);
        for node in frames {
            encode_node(w, node)?;
        }
        Ok(())
    })?;

    let mut crc = Crc32::new();
    crc.update(&w.buf);
    w.u32(crc.finalize());
    Ok(w.buf)
}

pub struct DecodedCheckpoint {
    pub instance_id: Uuid,
    pub checkpoint_id: u32,
    pub context_id: u32,
    pub class_version_digest: u32,
    pub globals: HashMap<String, Value>,
    pub frames: Vec<ContinuationNode>,
}

/// Decodes and validates a checkpoint. Magic/version/CRC mismatches, and a
/// `class_version_digest` that doesn't match the host-supplied
/// `expected_class_version_digest`, are all non-recoverable `RESTORE_ERROR`s
/// (`spec.md` §4.7) — the host is expected to treat any of these as "this
/// checkpoint cannot be resumed against the running schema", not retry.
pub fn decode(bytes: &[u8], expected_class_version_digest: u32) -> RunResult<DecodedCheckpoint> {
    if bytes.len() < 4 + 2 + 16 + 4 + 4 {
        return Err(restore_err("checkpoint too short"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected_crc = u32::from_le_bytes(trailer.try_into().unwrap());
    let mut crc = Crc32::new();
    crc.update(body);
    if crc.finalize() != expected_crc {
        return Err(restore_err("checkpoint CRC32 mismatch"));
    }

    let mut r = Reader::new(body);
    if r.take(4)? != MAGIC {
        return Err(restore_err("bad checkpoint magic"));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(restore_err(format!("unsupported checkpoint version {version}")));
    }
    let instance_id = Uuid::from_slice(r.take(16)?).map_err(|e| restore_err(e.to_string()))?;
    let checkpoint_id = r.u32()?;

    let mut context_id = 0u32;
    let mut class_version_digest = 0u32;
    let mut globals = HashMap::new();
    let mut frames = Vec::new();

    while r.remaining() > 0 {
        let tag = r.u8()?;
        let section = r.bytes()?;
        let mut sr = Reader::new(section);
        match tag {
            SECTION_CONTEXT_ID => context_id = sr.u32()?,
            SECTION_CLASS_VERSION_DIGEST => class_version_digest = sr.u32()?,
            SECTION_GLOBALS => {
                let n = sr.u32()?;
                for _ in 0..n {
                    let name = sr.str()?;
                    let value = decode_value(&mut sr)?;
                    globals.insert(name, value);
                }
            }
            SECTION_FRAMES => {
                let n = sr.u32()?;
                for _ in 0..n {
                    frames.push(decode_node(&mut sr)?);
                }
            }
            _ => {
                // Forward-compatible: an unrecognized section from a newer
                // writer is skipped rather than rejected.
            }
        }
    }

    if class_version_digest != expected_class_version_digest {
        return Err(restore_err("checkpoint class_version_digest does not match the running class schema"));
    }

    Ok(DecodedCheckpoint { instance_id, checkpoint_id, context_id, class_version_digest, globals, frames })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_values() {
        let mut w = Writer::new();
        let mut visiting = Vec::new();
        encode_value(&mut w, &Value::Int(42), &mut visiting).unwrap();
        encode_value(&mut w, &Value::Str(Rc::from("hi")), &mut visiting).unwrap();
        let mut r = Reader::new(&w.buf);
        assert!(matches!(decode_value(&mut r).unwrap(), Value::Int(42)));
        assert!(matches!(decode_value(&mut r).unwrap(), Value::Str(s) if &*s == "hi"));
    }

    #[test]
    fn detects_cyclic_list() {
        let list = Rc::new(std::cell::RefCell::new(Vec::new()));
        list.borrow_mut().push(Value::List(Rc::clone(&list)));
        let mut w = Writer::new();
        let mut visiting = Vec::new();
        let err = encode_value(&mut w, &Value::List(list), &mut visiting).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::CheckpointError);
    }

    #[test]
    fn full_checkpoint_round_trips() {
        let instance_id = Uuid::nil();
        let node = ContinuationNode {
            code_ref: CodeRef::Function(3),
            method_location: 12,
            locals: vec![Value::Int(1), Value::Null],
            captures: vec![],
            operand_stack: vec![Value::Boolean(true)],
        };
        let mut globals = HashMap::new();
        globals.insert("x".to_string(), Value::Long(7));
        let bytes = encode(instance_id, 1, 99, 5, &globals, &[node]).unwrap();
        let decoded = decode(&bytes, 5).unwrap();
        assert_eq!(decoded.checkpoint_id, 1);
        assert_eq!(decoded.context_id, 99);
        assert_eq!(decoded.frames.len(), 1);
        assert_eq!(decoded.frames[0].method_location, 12);
        assert!(decode(&bytes, 6).is_err());
    }
}
