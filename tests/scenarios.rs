//! End-to-end scenarios spanning more than one module: taint introduction
//! through a handler, recursive disassembly over a small code section,
//! and the protocol analyzers against a literal message buffer.

use std::cell::RefCell;

use lochs_taint::disasm::{ArgKind, ArgType, Disassembler, IcedDecoder, Inst, InstMem};
use lochs_taint::hashanalyzer::{MemRegion, Md5Analyzer, ProcContext, MD_SIZE};
use lochs_taint::host::{ApiInfoTable, InstructionDecoder, MemorySection, NoApiInfo, ProcessorView};
use lochs_taint::protocol::{Message, MessageTree, MessageTreeNode, MessageType, TokenizeRefiner};
use lochs_taint::taint::cputaint::Gpr;
use lochs_taint::taint::propagate::{handle_call, handle_ret, handle_xor};
use lochs_taint::taint::{Taint, TaintEngine, TaintRules};
use lochs_taint::trace::ExecFlags;

struct FakeProc {
    regs: RefCell<[u32; 8]>,
    flags: u32,
    section: Option<MemorySection>,
    code: Vec<u8>,
}

impl FakeProc {
    fn new() -> Self {
        FakeProc {
            regs: RefCell::new([0; 8]),
            flags: 0,
            section: None,
            code: Vec::new(),
        }
    }

    fn with_code(base: u32, code: Vec<u8>) -> Self {
        let size = code.len() as u32;
        FakeProc {
            regs: RefCell::new([0; 8]),
            flags: 0,
            section: Some(MemorySection {
                base,
                size,
                description: "test code".to_string(),
            }),
            code,
        }
    }

    fn set_gpr(&self, reg: Gpr, val: u32) {
        self.regs.borrow_mut()[reg as usize] = val;
    }
}

impl ProcessorView for FakeProc {
    fn eip(&self) -> u32 {
        0
    }
    fn gpr(&self, reg: Gpr) -> u32 {
        self.regs.borrow()[reg as usize]
    }
    fn flags(&self) -> u32 {
        self.flags
    }
    fn section_containing(&self, addr: u32) -> Option<MemorySection> {
        self.section.as_ref().filter(|s| s.contains(addr)).cloned()
    }
    fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let section = match &self.section {
            Some(s) if s.contains(addr) => s,
            _ => return Vec::new(),
        };
        let off = (addr - section.base) as usize;
        if off >= self.code.len() {
            return Vec::new();
        }
        let end = (off + len).min(self.code.len());
        self.code[off..end].to_vec()
    }
}

fn reg_arg(reg: Gpr, size: u32) -> ArgType {
    ArgType {
        kind: ArgKind::Gpr { reg, high_byte: false },
        size,
    }
}

fn inst_with_args(mnemonic: &str, args: Vec<Option<ArgType>>) -> Inst {
    let mut inst = Inst::invalid(0x1000);
    inst.is_invalid = false;
    inst.mnemonic = mnemonic.to_string();
    for (slot, arg) in inst.args.iter_mut().zip(args.into_iter().chain(std::iter::repeat(None))) {
        *slot = arg;
    }
    inst
}

#[test]
fn taint_introduced_at_a_source_clears_when_xored_with_itself() {
    let mut engine = TaintEngine::new(TaintRules::empty());
    let proc = FakeProc::new();

    let t = engine.introduce_taint(0x401000).unwrap();
    engine.cpu.set_gpr32(Gpr::Eax, lochs_taint::taint::value::TaintN::<4>([t; 4]));
    assert!(engine.cpu.gpr32(Gpr::Eax).is_any_tainted());

    let inst = inst_with_args("xor", vec![Some(reg_arg(Gpr::Eax, 32)), Some(reg_arg(Gpr::Eax, 32))]);
    handle_xor(&mut engine, &inst, &proc, ExecFlags::empty()).unwrap();

    assert!(!engine.cpu.gpr32(Gpr::Eax).is_any_tainted());
}

#[test]
fn call_then_ret_round_trips_the_return_address_taint_through_the_stack() {
    let mut engine = TaintEngine::new(TaintRules::empty());
    let proc = FakeProc::new();
    proc.set_gpr(Gpr::Esp, 0x2000);

    let t = engine.introduce_taint(0x401000).unwrap();
    engine.cpu.eip = lochs_taint::taint::value::TaintN::<4>([t; 4]);

    let call = inst_with_args("call", vec![Some(ArgType { kind: ArgKind::Immediate(0x5000), size: 32 })]);
    handle_call(&mut engine, &call, &proc, ExecFlags::empty()).unwrap();

    assert!(engine.mem_get(0x1ffc, 32).is_any_tainted());

    // the real CPU has since pushed the return address, leaving esp
    // pointing at the slot handle_call just wrote.
    proc.set_gpr(Gpr::Esp, 0x1ffc);
    engine.cpu.eip = lochs_taint::taint::value::Taint4::default();
    let ret = inst_with_args("ret", vec![]);
    handle_ret(&mut engine, &ret, &proc, ExecFlags::empty()).unwrap();

    assert!(engine.cpu.eip.is_any_tainted());
}

#[test]
fn recursive_disassembly_follows_fallthrough_and_stops_at_ret() {
    // nop; nop; ret
    let code = vec![0x90, 0x90, 0xc3];
    let proc = FakeProc::with_code(0x401000, code);
    let decoder = IcedDecoder::new32();
    let api: &dyn ApiInfoTable = &NoApiInfo;
    let mem = InstMem::new();

    Disassembler::recursive_disassemble(&mem, &proc, &decoder, api, 0x401000);
    mem.update_indices();

    assert!(mem.get(0x401000).is_some());
    assert!(mem.get(0x401001).is_some());
    let last = mem.get(0x401002).expect("ret should have been decoded");
    assert!(last.is_terminator());
    // nothing past the ret was queued
    assert!(mem.get(0x401003).is_none());
}

#[test]
fn disassemble_one_caches_and_is_idempotent() {
    let code = vec![0x90];
    let proc = FakeProc::with_code(0x401000, code);
    let decoder = IcedDecoder::new32();
    let api: &dyn ApiInfoTable = &NoApiInfo;
    let mem = InstMem::new();

    let first = Disassembler::disassemble_one(&mem, &proc, &decoder, api, 0x401000).unwrap();
    let second = Disassembler::disassemble_one(&mem, &proc, &decoder, api, 0x401000).unwrap();
    assert_eq!(first.eip, second.eip);
    assert_eq!(mem.section_count(), 1);
}

#[test]
fn md5_analyzer_recognizes_a_digest_computed_over_taint_engine_memory() {
    let mut engine = TaintEngine::new(TaintRules::empty());
    let input = b"the quick brown fox jumps".to_vec();

    let mut region_taint = Taint::new();
    for i in 0..input.len().min(lochs_taint::taint::WIDTH) {
        let t = engine.introduce_taint(0x600000 + i as u32).unwrap();
        region_taint = region_taint | t;
        engine.mem_set(
            0x700000 + i as u32,
            lochs_taint::taint::TaintValue::single(t),
        );
    }

    let digest = md5::compute(&input);

    let ctx = ProcContext {
        entry: 0x401000,
        inputs: input.clone(),
        outputs: digest.to_vec(),
        input_regions: vec![MemRegion { offset: 0, len: input.len() }],
        output_regions: vec![MemRegion { offset: 0, len: MD_SIZE }],
        input_taint: vec![region_taint],
    };

    let recognition = Md5Analyzer.on_original_procedure(&ctx).expect("should recognize MD5");
    assert_eq!(recognition.tag.name, "MD5");
    assert_eq!(recognition.output_bytes, digest.to_vec());
}

#[test]
fn tokenize_refiner_collapses_a_byte_split_ascii_word_at_depth_one() {
    let msg = Message::new(0, b"GET".to_vec());
    let mut root = MessageTreeNode::leaf(0, 2);
    root.children = vec![
        MessageTreeNode::leaf(0, 0),
        MessageTreeNode::leaf(1, 1),
        MessageTreeNode::leaf(2, 2),
    ];
    let mut tree = MessageTree::from_root(root);

    let mut refiner = TokenizeRefiner::new(&msg, MessageType::Ascii, 1);
    refiner.refine_tree(&mut tree);

    assert!(tree.root().is_leaf());
    assert_eq!(tree.root().l, 0);
    assert_eq!(tree.root().r, 2);
}
