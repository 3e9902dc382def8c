//! Recursive disassembly: decode an entry point and follow control flow
//! (fallthrough and branch/call targets) until every reachable
//! instruction in the section has been cached. Ported from
//! `Prophet/static/disassembler.cpp`'s `Disassemble`/`AddressToInst`.

use std::collections::{HashSet, VecDeque};

use crate::host::{ApiInfoTable, InstructionDecoder, ProcessorView};

use super::inst::Inst;
use super::mem::InstMem;

const MAX_INSTR_LEN: usize = 15;

pub struct Disassembler;

impl Disassembler {
    /// Decodes a single instruction at `addr` without following control
    /// flow, inserting it into `mem`. Returns the decoded instruction.
    pub fn disassemble_one(
        mem: &InstMem,
        proc: &dyn ProcessorView,
        decoder: &dyn InstructionDecoder,
        api: &dyn ApiInfoTable,
        addr: u32,
    ) -> Option<Inst> {
        if let Some(existing) = mem.get(addr) {
            return Some(existing);
        }

        let section = proc.section_containing(addr)?;
        mem.ensure_section(section.base, section.size);

        let bytes = proc.read_bytes(addr, MAX_INSTR_LEN);
        if bytes.is_empty() {
            return None;
        }

        let mut inst = decoder.decode(addr, &bytes);
        attach_api_info(&mut inst, api);
        mem.insert(inst.clone());
        Some(inst)
    }

    /// Decodes `entry` and transitively every instruction reachable from it
    /// by fallthrough or branch/call target, stopping at terminators,
    /// already-decoded addresses, and addresses outside any known section
    /// (spec §4.3).
    pub fn recursive_disassemble(
        mem: &InstMem,
        proc: &dyn ProcessorView,
        decoder: &dyn InstructionDecoder,
        api: &dyn ApiInfoTable,
        entry: u32,
    ) {
        let mut queue = VecDeque::new();
        let mut queued = HashSet::new();
        queue.push_back(entry);
        queued.insert(entry);

        while let Some(addr) = queue.pop_front() {
            if mem.contains(addr) {
                continue;
            }

            let inst = match Self::disassemble_one(mem, proc, decoder, api, addr) {
                Some(inst) => inst,
                None => continue,
            };

            if inst.is_terminator() {
                continue;
            }

            if !is_unconditional_jump(&inst) {
                let fallthrough = addr.wrapping_add(inst.length);
                if queued.insert(fallthrough) {
                    queue.push_back(fallthrough);
                }
            }

            if let Some(target) = inst.target {
                if queued.insert(target) {
                    queue.push_back(target);
                }
            }
        }

        mem.update_indices();
    }
}

fn is_unconditional_jump(inst: &Inst) -> bool {
    inst.mnemonic == "jmp"
}

fn attach_api_info(inst: &mut Inst, api: &dyn ApiInfoTable) {
    if let Some(target) = inst.target {
        if let Some(info) = api.lookup(target) {
            inst.target_module_name = Some(info.module_name);
            inst.target_func_name = Some(info.function_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::inst::{ArgKind, ArgType};
    use crate::host::{ApiInfo, MemorySection, NoApiInfo};
    use crate::taint::cputaint::Gpr;

    struct FakeProc {
        section: MemorySection,
        code: Vec<u8>,
    }

    impl ProcessorView for FakeProc {
        fn eip(&self) -> u32 {
            self.section.base
        }
        fn gpr(&self, _reg: Gpr) -> u32 {
            0
        }
        fn flags(&self) -> u32 {
            0
        }
        fn section_containing(&self, addr: u32) -> Option<MemorySection> {
            if self.section.contains(addr) {
                Some(self.section.clone())
            } else {
                None
            }
        }
        fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
            let off = (addr - self.section.base) as usize;
            if off >= self.code.len() {
                return Vec::new();
            }
            let end = (off + len).min(self.code.len());
            self.code[off..end].to_vec()
        }
    }

    struct FakeDecoder;

    impl InstructionDecoder for FakeDecoder {
        fn decode(&self, eip: u32, bytes: &[u8]) -> Inst {
            // two-byte encoding: [opcode, length] for test purposes.
            let mut inst = Inst::invalid(eip);
            inst.is_invalid = false;
            inst.length = bytes.get(1).copied().unwrap_or(1) as u32;
            match bytes[0] {
                0x01 => inst.mnemonic = "nop".to_string(),
                0xEB => {
                    inst.mnemonic = "jmp".to_string();
                    inst.target = Some(eip.wrapping_add(bytes[2] as u32));
                    inst.length = 3;
                }
                0xC3 => inst.mnemonic = "ret".to_string(),
                _ => inst.is_invalid = true,
            }
            inst
        }
    }

    #[test]
    fn stops_at_terminator_and_follows_jmp_target() {
        let mem = InstMem::new();
        let proc = FakeProc {
            section: MemorySection {
                base: 0x1000,
                size: 0x100,
                description: "text".to_string(),
            },
            code: vec![
                0xEB, 0x00, 0x05, // jmp +5 -> 0x1008
                0x00, 0x00, // padding (skipped, unreachable)
                0x01, 0x00, // nop (len ignored, defaults 1) at 0x1005 unreachable
                0x01, 0x00, // at 0x1008 but let's recompute below
            ],
        };
        Disassembler::recursive_disassemble(&mem, &proc, &FakeDecoder, &NoApiInfo, 0x1000);

        assert!(mem.get(0x1000).is_some());
        assert!(mem.get(0x1003).is_none());
        let jmp_target = mem.get(0x1000).unwrap().target.unwrap();
        assert!(mem.get(jmp_target).is_some());
    }

    #[test]
    fn unknown_opcode_is_not_followed() {
        let mem = InstMem::new();
        let proc = FakeProc {
            section: MemorySection {
                base: 0x2000,
                size: 0x10,
                description: "text".to_string(),
            },
            code: vec![0xFF],
        };
        Disassembler::recursive_disassemble(&mem, &proc, &FakeDecoder, &NoApiInfo, 0x2000);
        let inst = mem.get(0x2000).unwrap();
        assert!(inst.is_invalid);
        assert!(mem.get(0x2001).is_none());
    }

    #[test]
    fn api_info_is_attached_to_call_targets() {
        struct OneApi;
        impl ApiInfoTable for OneApi {
            fn lookup(&self, addr: u32) -> Option<ApiInfo> {
                if addr == 0x3010 {
                    Some(ApiInfo {
                        module_name: "kernel32.dll".to_string(),
                        function_name: "ExitProcess".to_string(),
                    })
                } else {
                    None
                }
            }
        }

        struct CallDecoder;
        impl InstructionDecoder for CallDecoder {
            fn decode(&self, eip: u32, _bytes: &[u8]) -> Inst {
                let mut inst = Inst::invalid(eip);
                inst.is_invalid = false;
                inst.mnemonic = "call".to_string();
                inst.length = 5;
                inst.target = Some(0x3010);
                inst.args[0] = Some(ArgType {
                    kind: ArgKind::Immediate(0x3010),
                    size: 32,
                });
                inst
            }
        }

        let mem = InstMem::new();
        let proc = FakeProc {
            section: MemorySection {
                base: 0x3000,
                size: 0x100,
                description: "text".to_string(),
            },
            code: vec![0xE8, 0, 0, 0, 0],
        };
        Disassembler::disassemble_one(&mem, &proc, &CallDecoder, &OneApi, 0x3000);
        let inst = mem.get(0x3000).unwrap();
        assert_eq!(inst.target_module_name.as_deref(), Some("kernel32.dll"));
        assert_eq!(inst.target_func_name.as_deref(), Some("ExitProcess"));
    }
}
