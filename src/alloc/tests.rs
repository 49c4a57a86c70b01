/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::allocate;
use super::data_structures::{IntervalLocation, LinearScan};
use crate::block_order::compute_linear_scan_order;
use crate::cfg::tests::cfg_from_succs;
use crate::constant::Constant;
use crate::frame_map::{FrameMap, FrameMapBuilder};
use crate::graph::{BinaryOp, Condition};
use crate::lir::{BytecodeFrame, Lir, LirFrameState, LirInstruction, LirOp};
use crate::result::CallTarget;
use crate::target::amd64::*;
use crate::target::{Register, TargetDescription};
use crate::value::{Kind, Value, Variable};
use crate::{Block, CompileError, CompilerOptions, MethodId, Stats};
use smallvec::smallvec;
use std::collections::HashMap;

const CALL_RESULT: i64 = 1000;
const POISON: i64 = -0x5a5a;

fn int(x: i32) -> Value {
    Value::Constant(Constant::Int(x))
}

fn long(x: i64) -> Value {
    Value::Constant(Constant::Long(x))
}

fn var(v: Variable) -> Value {
    Value::Variable(v)
}

fn binary(op: BinaryOp, dst: Variable, x: Variable, y: Value) -> LirInstruction {
    LirInstruction::new(LirOp::Binary { op }, smallvec![var(dst), var(x), y], None)
}

fn ret(v: Value) -> LirInstruction {
    LirInstruction::new(LirOp::Return, smallvec![v], None)
}

fn call(result: Value, args: Vec<Value>) -> LirInstruction {
    let mut operands = smallvec![result];
    operands.extend(args);
    LirInstruction::new(
        LirOp::Call {
            target: CallTarget::Method(MethodId::new(7)),
        },
        operands,
        None,
    )
}

struct Fixture {
    lir: Lir,
    target: TargetDescription,
}

struct Allocated {
    stats: Stats,
    frame: FrameMap,
}

impl Fixture {
    fn new(succs: &[&[usize]], probabilities: &[f64]) -> Self {
        Fixture {
            lir: Lir::new(cfg_from_succs(succs, probabilities)),
            target: TargetDescription::amd64(),
        }
    }

    fn var(&mut self, kind: Kind) -> Variable {
        self.lir.new_variable(kind)
    }

    fn reg(&self, reg: Register, kind: Kind) -> Value {
        Value::Register(self.target.arch.register_value(reg, kind))
    }

    fn block(&mut self, b: usize, ops: Vec<LirInstruction>) {
        let block = Block::new(b);
        let mut all = vec![LirInstruction::label(block)];
        all.extend(ops);
        self.lir.set_block_ops(block, all);
    }

    fn allocate(&mut self) -> Result<Allocated, CompileError> {
        let order = compute_linear_scan_order(self.lir.cfg_mut());
        self.lir.set_linear_scan_order(order);
        let options = CompilerOptions::default();
        let mut frame = FrameMapBuilder::new(&self.target.arch, &options);
        let mut stats = Stats::default();
        allocate(&mut self.lir, &self.target, &mut frame, &options, &mut stats)?;
        let frame = frame.finish(&self.target.arch, options.max_frame_size)?;
        Ok(Allocated { stats, frame })
    }

    fn assert_no_variables(&self) {
        for &block in self.lir.linear_scan_order() {
            for inst in self.lir.block_ops(block) {
                inst.for_each_operand(|v, _, _| {
                    assert!(v.as_variable().is_none(), "{} left in {}", v, inst.op.name())
                });
                inst.for_each_state_value(|v, _| {
                    assert!(v.as_variable().is_none(), "{} left in a frame state", v)
                });
            }
        }
    }

    fn run(&self) -> i64 {
        Machine {
            target: &self.target,
            regs: HashMap::new(),
            slots: HashMap::new(),
            vars: HashMap::new(),
        }
        .run(&self.lir)
    }
}

/// Executes LIR, before or after allocation. Calls poison every
/// caller-saved register before writing their result.
struct Machine<'t> {
    target: &'t TargetDescription,
    regs: HashMap<Register, i64>,
    slots: HashMap<u32, i64>,
    vars: HashMap<u32, i64>,
}

impl<'t> Machine<'t> {
    fn read(&self, v: &Value) -> i64 {
        match v {
            Value::Register(r) => *self
                .regs
                .get(&r.reg)
                .unwrap_or_else(|| panic!("read of undefined {}", r.reg)),
            Value::VirtualStackSlot(s) => *self
                .slots
                .get(&s.id)
                .unwrap_or_else(|| panic!("read of undefined {}", s)),
            Value::Variable(var) => *self
                .vars
                .get(&var.index)
                .unwrap_or_else(|| panic!("read of undefined {}", var)),
            Value::Constant(Constant::Int(x)) => *x as i64,
            Value::Constant(Constant::Long(x)) => *x,
            Value::Constant(Constant::Null) => 0,
            other => panic!("unexpected operand {}", other),
        }
    }

    fn write(&mut self, v: &Value, x: i64) {
        match v {
            Value::Register(r) => {
                self.regs.insert(r.reg, x);
            }
            Value::VirtualStackSlot(s) => {
                self.slots.insert(s.id, x);
            }
            Value::Variable(var) => {
                self.vars.insert(var.index, x);
            }
            other => panic!("unexpected result {}", other),
        }
    }

    fn run(&mut self, lir: &Lir) -> i64 {
        let mut block = lir.cfg().entry();
        let mut steps = 0;
        'blocks: loop {
            for inst in lir.block_ops(block) {
                steps += 1;
                assert!(steps < 100_000, "runaway execution");
                let ops = &inst.operands;
                match &inst.op {
                    LirOp::Label { .. } | LirOp::Safepoint => {}
                    LirOp::Move => {
                        let x = self.read(&ops[1]);
                        self.write(&ops[0], x);
                    }
                    LirOp::Binary { op } => {
                        let (a, b) = (self.read(&ops[1]), self.read(&ops[2]));
                        let r = match op {
                            BinaryOp::Add => a.wrapping_add(b),
                            BinaryOp::Sub => a.wrapping_sub(b),
                            BinaryOp::Mul => a.wrapping_mul(b),
                            BinaryOp::And => a & b,
                            BinaryOp::Or => a | b,
                            BinaryOp::Xor => a ^ b,
                        };
                        self.write(&ops[0], r);
                    }
                    LirOp::Call { .. } => {
                        for &r in self.target.arch.registers() {
                            if self.target.register_config.is_caller_saved(r) {
                                self.regs.insert(r, POISON);
                            }
                        }
                        if !ops[0].is_illegal() {
                            self.write(&ops[0], CALL_RESULT);
                        }
                    }
                    LirOp::Jump { target } => {
                        block = *target;
                        continue 'blocks;
                    }
                    LirOp::CompareBranch {
                        condition,
                        true_target,
                        false_target,
                        ..
                    } => {
                        let (a, b) = (self.read(&ops[0]), self.read(&ops[1]));
                        let taken = match condition {
                            Condition::Eq => a == b,
                            Condition::Ne => a != b,
                            Condition::Lt => a < b,
                            Condition::Le => a <= b,
                            Condition::Gt => a > b,
                            Condition::Ge => a >= b,
                            Condition::Below => (a as u64) < (b as u64),
                            Condition::AboveEqual => (a as u64) >= (b as u64),
                        };
                        block = if taken { *true_target } else { *false_target };
                        continue 'blocks;
                    }
                    LirOp::Return => {
                        return if ops[0].is_illegal() {
                            0
                        } else {
                            self.read(&ops[0])
                        };
                    }
                    other => panic!("cannot interpret {:?}", other),
                }
            }
            panic!("{} fell through", block);
        }
    }
}

#[test]
fn straight_line_sum() {
    let mut f = Fixture::new(&[&[]], &[1.0]);
    let (a, b, c) = (f.var(Kind::Int), f.var(Kind::Int), f.var(Kind::Int));
    let rax = f.reg(RAX, Kind::Int);
    f.block(
        0,
        vec![
            LirInstruction::mov(var(a), int(3)),
            LirInstruction::mov(var(b), int(4)),
            binary(BinaryOp::Add, c, a, var(b)),
            LirInstruction::mov(rax.clone(), var(c)),
            ret(rax),
        ],
    );
    let out = f.allocate().unwrap();
    f.assert_no_variables();
    assert_eq!(out.stats.spilled_intervals, 0);
    assert_eq!(f.run(), 7);
}

#[test]
fn pressure_forces_spills() {
    let mut f = Fixture::new(&[&[]], &[1.0]);
    let vals: Vec<Variable> = (0..16).map(|_| f.var(Kind::Long)).collect();
    let sums: Vec<Variable> = (0..15).map(|_| f.var(Kind::Long)).collect();
    let rax = f.reg(RAX, Kind::Long);
    let mut ops = vec![];
    for (i, &v) in vals.iter().enumerate() {
        ops.push(LirInstruction::mov(var(v), long(i as i64 + 1)));
    }
    let mut acc = vals[0];
    for (i, &s) in sums.iter().enumerate() {
        ops.push(binary(BinaryOp::Add, s, acc, var(vals[i + 1])));
        acc = s;
    }
    ops.push(LirInstruction::mov(rax.clone(), var(acc)));
    ops.push(ret(rax));
    f.block(0, ops);

    let out = f.allocate().unwrap();
    f.assert_no_variables();
    assert!(out.stats.spilled_intervals > 0);
    assert!(out.stats.spill_slots > 0);
    assert_eq!(f.run(), 136);
}

#[test]
fn loop_carried_values() {
    // 0 -> 1 (header) -> 2 (body) -> 1 | 3 (exit)
    let mut f = Fixture::new(&[&[1], &[2, 3], &[1], &[]], &[1.0, 10.0, 9.0, 1.0]);
    let i = f.var(Kind::Long);
    let s = f.var(Kind::Long);
    let cs: Vec<Variable> = (0..13).map(|_| f.var(Kind::Long)).collect();
    let (t, u) = (f.var(Kind::Long), f.var(Kind::Long));
    let rs: Vec<Variable> = (0..13).map(|_| f.var(Kind::Long)).collect();
    let rax = f.reg(RAX, Kind::Long);

    let mut entry = vec![
        LirInstruction::mov(var(i), long(0)),
        LirInstruction::mov(var(s), long(0)),
    ];
    for (k, &c) in cs.iter().enumerate() {
        entry.push(LirInstruction::mov(var(c), long(k as i64 + 1)));
    }
    entry.push(LirInstruction::jump(Block::new(1)));
    f.block(0, entry);

    f.block(
        1,
        vec![LirInstruction::new(
            LirOp::CompareBranch {
                condition: Condition::Lt,
                kind: Kind::Long,
                true_target: Block::new(2),
                false_target: Block::new(3),
                true_probability: 0.9,
            },
            smallvec![var(i), long(10)],
            None,
        )],
    );
    f.block(
        2,
        vec![
            binary(BinaryOp::Add, t, s, var(i)),
            binary(BinaryOp::Add, u, i, long(1)),
            LirInstruction::mov(var(s), var(t)),
            LirInstruction::mov(var(i), var(u)),
            LirInstruction::jump(Block::new(1)),
        ],
    );
    let mut exit = vec![];
    let mut acc = s;
    for (k, &r) in rs.iter().enumerate() {
        exit.push(binary(BinaryOp::Add, r, acc, var(cs[k])));
        acc = r;
    }
    exit.push(LirInstruction::mov(rax.clone(), var(acc)));
    exit.push(ret(rax));
    f.block(3, exit);

    let out = f.allocate().unwrap();
    f.assert_no_variables();
    assert!(out.stats.spilled_intervals > 0);
    // 0 + 1 + ... + 9, plus 1 + ... + 13.
    assert_eq!(f.run(), 45 + 91);
}

#[test]
fn call_clobbers_caller_saved() {
    let mut f = Fixture::new(&[&[]], &[1.0]);
    let (a, b, r, x, y) = (
        f.var(Kind::Long),
        f.var(Kind::Long),
        f.var(Kind::Long),
        f.var(Kind::Long),
        f.var(Kind::Long),
    );
    let rax = f.reg(RAX, Kind::Long);
    f.block(
        0,
        vec![
            LirInstruction::mov(var(a), long(5)),
            LirInstruction::mov(var(b), long(6)),
            call(rax.clone(), vec![]),
            LirInstruction::mov(var(r), rax.clone()),
            binary(BinaryOp::Add, x, a, var(b)),
            binary(BinaryOp::Add, y, x, var(r)),
            LirInstruction::mov(rax.clone(), var(y)),
            ret(rax),
        ],
    );
    let out = f.allocate().unwrap();
    f.assert_no_variables();
    // Values live across the call end up in callee-saved registers.
    assert!(!out.frame.callee_saved().is_empty());
    assert_eq!(f.run(), 5 + 6 + CALL_RESULT);
}

#[test]
fn reference_maps_list_live_objects() {
    let mut f = Fixture::new(&[&[]], &[1.0]);
    let o = f.var(Kind::Object);
    let n = f.var(Kind::Int);
    let frame = BytecodeFrame::new(
        None,
        MethodId::new(0),
        3,
        false,
        false,
        vec![var(o), var(n)],
        2,
        0,
        0,
    );
    let rax = f.reg(RAX, Kind::Object);
    f.block(
        0,
        vec![
            LirInstruction::mov(var(o), Value::Constant(Constant::Null)),
            LirInstruction::mov(var(n), int(1)),
            LirInstruction::new(
                LirOp::Safepoint,
                smallvec![],
                Some(LirFrameState::new(frame, None)),
            ),
            LirInstruction::mov(rax.clone(), var(o)),
            ret(rax),
        ],
    );
    f.allocate().unwrap();
    f.assert_no_variables();

    let safepoint = f
        .lir
        .block_ops(Block::new(0))
        .iter()
        .find(|i| i.op == LirOp::Safepoint)
        .unwrap();
    let state = safepoint.state.as_ref().unwrap();
    let map = state.reference_map().unwrap();
    assert_eq!(map.registers.len() + map.slots.len(), 1);
    match &state.top_frame.values[0] {
        Value::Register(r) => assert_eq!(&map.registers[..], &[r.reg]),
        other => assert_eq!(&map.slots[..], &[other.clone()]),
    }
}

#[test]
fn allocator_exhausted() {
    let mut f = Fixture::new(&[&[]], &[1.0]);
    let x = f.var(Kind::Long);
    let v = f.var(Kind::Long);
    let allocatable: Vec<Register> = f
        .target
        .register_config
        .allocatable(crate::target::RegisterCategory::Cpu)
        .collect();
    assert_eq!(allocatable.len(), 12);

    let mut ops = vec![LirInstruction::mov(var(x), long(1))];
    let mut args = vec![];
    for &reg in &allocatable {
        let value = f.reg(reg, Kind::Long);
        ops.push(LirInstruction::mov(value.clone(), long(2)));
        args.push(value);
    }
    ops.push(binary(BinaryOp::Add, v, x, long(1)));
    ops.push(call(Value::Illegal, args));
    ops.push(ret(Value::Illegal));
    f.block(0, ops);

    match f.allocate() {
        Err(CompileError::AllocatorExhausted { .. }) => {}
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("allocation should have failed"),
    }
}

#[test]
fn split_move_reads_from_the_latest_piece() {
    // v lives in [2, 10). Splitting the root at 7 and then again at 5
    // leaves rcx -> rdx at 5 and rdx -> stack at 7; rcx is clobbered
    // in between, so the second move must not read it.
    let mut f = Fixture::new(&[&[]], &[1.0]);
    let v = f.var(Kind::Long);
    let rax = f.reg(RAX, Kind::Long);
    let rcx = f.reg(RCX, Kind::Long);
    let rsi = f.reg(RSI, Kind::Long);
    f.block(
        0,
        vec![
            LirInstruction::mov(var(v), long(1)),
            LirInstruction::mov(rsi.clone(), long(2)),
            LirInstruction::mov(rcx, long(99)),
            LirInstruction::mov(rsi, long(3)),
            LirInstruction::mov(rax.clone(), var(v)),
            ret(rax),
        ],
    );
    let order = compute_linear_scan_order(f.lir.cfg_mut());
    f.lir.set_linear_scan_order(order);

    let options = CompilerOptions::default();
    let mut frame = FrameMapBuilder::new(&f.target.arch, &options);
    let mut stats = Stats::default();
    {
        let mut ls = LinearScan::new(&mut f.lir, &f.target, &mut frame, &options, &mut stats);
        ls.init();
        let root = ls.var_intervals[v.index()];
        let late = ls.split_interval(root, 7);
        let early = ls.split_interval(root, 5);
        assert_eq!(&ls.intervals[root].children[..], &[early, late]);
        ls.intervals[root].location = IntervalLocation::Reg(RCX);
        ls.intervals[early].location = IntervalLocation::Reg(RDX);
        ls.intervals[late].location = IntervalLocation::Stack;
        ls.allocate_spill_slots();
        let pending = ls.resolve_data_flow();
        ls.assign_locations(pending);
    }
    assert_eq!(stats.split_moves, 2);
    f.assert_no_variables();
    assert_eq!(f.run(), 1);
}

/// Xorshift64; enough to make generated programs reproducible.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        XorShift(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

const BINARY_OPS: [BinaryOp; 6] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::And,
    BinaryOp::Or,
    BinaryOp::Xor,
];

const CONDITIONS: [Condition; 8] = [
    Condition::Eq,
    Condition::Ne,
    Condition::Lt,
    Condition::Le,
    Condition::Gt,
    Condition::Ge,
    Condition::Below,
    Condition::AboveEqual,
];

/// Random structured programs over long values: arithmetic, diamonds,
/// counted loops and calls. Every value is defined in the entry block
/// and folded into the returned result. No edge is critical.
struct ProgramGen {
    rng: XorShift,
    rax: Value,
    values: Vec<Variable>,
    num_vars: usize,
    succs: Vec<Vec<usize>>,
    freqs: Vec<f64>,
    ops: Vec<Vec<LirInstruction>>,
}

impl ProgramGen {
    fn new(seed: u64, rax: Value) -> Self {
        let mut rng = XorShift::new(seed);
        let num_values = 6 + rng.below(10);
        ProgramGen {
            rng,
            rax,
            values: (0..num_values).map(|i| Variable::new(i, Kind::Long)).collect(),
            num_vars: num_values,
            succs: vec![],
            freqs: vec![],
            ops: vec![],
        }
    }

    fn fresh(&mut self) -> Variable {
        let v = Variable::new(self.num_vars, Kind::Long);
        self.num_vars += 1;
        v
    }

    fn new_block(&mut self, freq: f64) -> usize {
        self.succs.push(vec![]);
        self.freqs.push(freq);
        self.ops.push(vec![]);
        self.ops.len() - 1
    }

    fn jump(&mut self, from: usize, to: usize) {
        self.ops[from].push(LirInstruction::jump(Block::new(to)));
        self.succs[from].push(to);
    }

    fn branch(&mut self, from: usize, condition: Condition, x: Variable, y: Value, p: f64, t: usize, e: usize) {
        self.ops[from].push(LirInstruction::new(
            LirOp::CompareBranch {
                condition,
                kind: Kind::Long,
                true_target: Block::new(t),
                false_target: Block::new(e),
                true_probability: p,
            },
            smallvec![var(x), y],
            None,
        ));
        self.succs[from].extend_from_slice(&[t, e]);
    }

    fn pick(&mut self) -> Variable {
        self.values[self.rng.below(self.values.len())]
    }

    /// A value other than `not`, or a small constant.
    fn operand(&mut self, not: Variable) -> Value {
        let v = self.pick();
        if v == not || self.rng.below(4) == 0 {
            long(self.rng.below(100) as i64 - 50)
        } else {
            var(v)
        }
    }

    fn arithmetic(&mut self, block: usize) {
        let dst = self.pick();
        let inst = match self.rng.below(5) {
            0 => LirInstruction::mov(var(dst), long(self.rng.below(1000) as i64)),
            1 => {
                let src = self.operand(dst);
                LirInstruction::mov(var(dst), src)
            }
            _ => {
                let op = BINARY_OPS[self.rng.below(BINARY_OPS.len())];
                let x = self.pick();
                let y = self.operand(dst);
                binary(op, dst, x, y)
            }
        };
        self.ops[block].push(inst);
    }

    /// Emits one to a few segments starting in `block` and returns the
    /// block they end in, still without a terminator.
    fn region(&mut self, mut block: usize, depth: u32, freq: f64) -> usize {
        let segments = 1 + self.rng.below(if depth == 0 { 4 } else { 2 });
        for _ in 0..segments {
            match self.rng.below(4) {
                0 if depth < 3 => block = self.diamond(block, depth, freq),
                1 if depth < 2 => block = self.counted_loop(block, depth, freq),
                2 => {
                    let dst = self.pick();
                    self.ops[block].push(call(self.rax.clone(), vec![]));
                    self.ops[block].push(LirInstruction::mov(var(dst), self.rax.clone()));
                }
                _ => {
                    for _ in 0..1 + self.rng.below(4) {
                        self.arithmetic(block);
                    }
                }
            }
        }
        block
    }

    fn diamond(&mut self, block: usize, depth: u32, freq: f64) -> usize {
        let x = self.pick();
        let y = self.operand(x);
        let condition = CONDITIONS[self.rng.below(CONDITIONS.len())];
        let then = self.new_block(freq / 2.0);
        let other = self.new_block(freq / 2.0);
        self.branch(block, condition, x, y, 0.5, then, other);
        let then_end = self.region(then, depth + 1, freq / 2.0);
        let other_end = self.region(other, depth + 1, freq / 2.0);
        let join = self.new_block(freq);
        self.jump(then_end, join);
        self.jump(other_end, join);
        join
    }

    fn counted_loop(&mut self, block: usize, depth: u32, freq: f64) -> usize {
        let counter = self.fresh();
        let trips = 1 + self.rng.below(3) as i64;
        self.ops[block].push(LirInstruction::mov(var(counter), long(0)));
        let header = self.new_block(freq * 10.0);
        self.jump(block, header);
        let body = self.new_block(freq * 9.0);
        let exit = self.new_block(freq);
        self.branch(header, Condition::Lt, counter, long(trips), 0.9, body, exit);
        let body_end = self.region(body, depth + 1, freq * 9.0);
        self.ops[body_end].push(binary(BinaryOp::Add, counter, counter, long(1)));
        self.jump(body_end, header);
        exit
    }
}

fn generated_program(seed: u64) -> Fixture {
    let target = TargetDescription::amd64();
    let rax = Value::Register(target.arch.register_value(RAX, Kind::Long));
    let mut g = ProgramGen::new(seed, rax.clone());

    let entry = g.new_block(1.0);
    for k in 0..g.values.len() {
        let v = g.values[k];
        g.ops[entry].push(LirInstruction::mov(var(v), long(7 * k as i64 + 1)));
    }
    let end = g.region(entry, 0, 1.0);
    let acc = g.fresh();
    g.ops[end].push(LirInstruction::mov(var(acc), long(0)));
    for k in 0..g.values.len() {
        let v = g.values[k];
        g.ops[end].push(binary(BinaryOp::Mul, acc, acc, long(31)));
        g.ops[end].push(binary(BinaryOp::Add, acc, acc, var(v)));
    }
    g.ops[end].push(LirInstruction::mov(rax.clone(), var(acc)));
    g.ops[end].push(ret(rax));

    let succs: Vec<&[usize]> = g.succs.iter().map(|s| &s[..]).collect();
    let mut f = Fixture::new(&succs, &g.freqs);
    for _ in 0..g.num_vars {
        f.var(Kind::Long);
    }
    for (b, ops) in g.ops.into_iter().enumerate() {
        f.block(b, ops);
    }
    f
}

#[test]
fn generated_programs_compute_the_same_result() {
    for seed in 1..=200u64 {
        let mut f = generated_program(seed);
        let expected = f.run();
        if let Err(e) = f.allocate() {
            panic!("seed {}: {}", seed, e);
        }
        f.assert_no_variables();
        assert_eq!(f.run(), expected, "seed {}:\n{}", seed, f.lir);
    }
}
