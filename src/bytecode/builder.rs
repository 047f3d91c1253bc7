//! Incremental code builder (`spec.md` §4.4), modeled on the teacher's
//! `bytecode::Builder`: emit opcodes against a growing buffer, reserve
//! labels up front, and patch relative jump offsets once both ends of a
//! jump are known.

use std::collections::HashMap;

use crate::{
    ast::Offset,
    bytecode::{
        code::{Code, ConstValue},
        op::Opcode,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

pub struct CodeBuilder {
    opcodes: Vec<Opcode>,
    offsets: Vec<Offset>,
    consts: Vec<ConstValue>,
    next_label: u32,
    label_targets: HashMap<Label, u32>,
    pending_patches: Vec<(usize, Label)>,
    pub local_count: u32,
    pub param_count: u32,
    pub is_async: bool,
    pub state_save_map: HashMap<u32, u32>,
    next_save_point: u32,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(param_count: u32) -> Self {
        Self {
            opcodes: Vec::new(),
            offsets: Vec::new(),
            consts: Vec::new(),
            next_label: 0,
            label_targets: HashMap::new(),
            pending_patches: Vec::new(),
            local_count: param_count,
            param_count,
            is_async: false,
            state_save_map: HashMap::new(),
            next_save_point: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn bind_label(&mut self, label: Label) {
        self.label_targets.insert(label, self.opcodes.len() as u32);
    }

    pub fn emit(&mut self, op: Opcode, offset: Offset) -> usize {
        self.opcodes.push(op);
        self.offsets.push(offset);
        self.opcodes.len() - 1
    }

    pub fn emit_jump_if_false(&mut self, label: Label, offset: Offset) {
        let idx = self.emit(Opcode::JumpIfFalse(0), offset);
        self.pending_patches.push((idx, label));
    }

    pub fn emit_jump_if_true(&mut self, label: Label, offset: Offset) {
        let idx = self.emit(Opcode::JumpIfTrue(0), offset);
        self.pending_patches.push((idx, label));
    }

    pub fn emit_jump(&mut self, label: Label, offset: Offset) {
        let idx = self.emit(Opcode::Jump(0), offset);
        self.pending_patches.push((idx, label));
    }

    pub fn emit_elvis_jump(&mut self, label: Label, offset: Offset) {
        let idx = self.emit(Opcode::ElvisJump(0), offset);
        self.pending_patches.push((idx, label));
    }

    pub fn reserve_local(&mut self) -> u32 {
        let slot = self.local_count;
        self.local_count += 1;
        slot
    }

    pub fn reserve_save_point(&mut self) -> u32 {
        let id = self.next_save_point;
        self.next_save_point += 1;
        id
    }

    pub fn mark_save_point_resume(&mut self, id: u32) {
        self.state_save_map.insert(id, self.opcodes.len() as u32);
    }

    pub fn add_const(&mut self, value: ConstValue) -> u32 {
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    pub fn here(&self) -> u32 {
        self.opcodes.len() as u32
    }

    #[must_use]
    pub fn finish(mut self) -> Code {
        for (idx, label) in &self.pending_patches {
            let target = *self.label_targets.get(label).expect("unbound label");
            let rel = target as i64 - *idx as i64 - 1;
            let rel = rel as i32;
            match &mut self.opcodes[*idx] {
                Opcode::JumpIfFalse(r) | Opcode::JumpIfTrue(r) | Opcode::Jump(r) | Opcode::ElvisJump(r) => *r = rel,
                _ => unreachable!("patch target is not a jump opcode"),
            }
        }
        Code {
            opcodes: self.opcodes,
            offsets: self.offsets,
            consts: self.consts,
            local_count: self.local_count,
            param_count: self.param_count,
            is_async: self.is_async,
            state_save_map: self.state_save_map,
        }
    }
}
