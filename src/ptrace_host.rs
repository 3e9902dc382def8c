//! A ptrace-based Linux x86 demonstration host. Implements `host::ProcessorView`
//! over a live, single-stepped tracee so the disassembler and taint engine can
//! run against a real process. Not part of the portable core (§1/§6 put the
//! host emulator out of scope); this is the crate's one concrete host.

use anyhow::{anyhow, Context, Result};
use iced_x86::{
    Code, Decoder, DecoderOptions, Instruction, InstructionInfoFactory, InstructionInfoOptions,
    MemorySize, Mnemonic, OpAccess, Register,
};
use nix::sys::ptrace;
use nix::sys::signal;
use nix::sys::uio;
use nix::sys::wait;
use nix::unistd::Pid;
use rangemap::RangeMap;
use serde::Serialize;
use spawn_ptrace::CommandPtraceSpawn;

use std::convert::{TryFrom, TryInto};
use std::process::Command;

use crate::host::{MemorySection, ProcessorView};
use crate::taint::cputaint::Gpr;

const MAX_INSTR_LEN: usize = 15;

/// Represents the width of a concrete memory operation.
///
/// All memory operations this host models are 1, 2, 4, or 8 bytes.
/// Larger operations are either modeled as multiple individual operations
/// (if caused by a `REP` prefix), ignored (if configured), or cause a fatal error.
#[derive(Clone, Copy, Debug, Serialize)]
pub enum MemoryMask {
    Byte = 1,
    Word = 2,
    DWord = 4,
    QWord = 8,
}

impl TryFrom<u64> for MemoryMask {
    type Error = anyhow::Error;

    fn try_from(size: u64) -> Result<Self> {
        Ok(match size {
            1 => MemoryMask::Byte,
            2 => MemoryMask::Word,
            4 => MemoryMask::DWord,
            8 => MemoryMask::QWord,
            _ => return Err(anyhow!("size {} doesn't have a supported mask", size)),
        })
    }
}

impl TryFrom<Register> for MemoryMask {
    type Error = anyhow::Error;

    fn try_from(reg: Register) -> Result<Self> {
        (reg.info().size() as u64).try_into()
    }
}

/// The access disposition of a concrete memory operation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub enum MemoryOp {
    Read,
    Write,
}

/// One traced memory operation: its kind, size, concrete address, and data.
#[derive(Debug, Serialize)]
pub struct MemoryHint {
    address: u64,
    operation: MemoryOp,
    mask: MemoryMask,
    data: u64,
}

/// One raw step of the demonstration tracer, kept for the binary's
/// `--dump-raw` parity mode alongside the archive contract.
#[derive(Debug, Serialize)]
pub struct Step {
    instr: Vec<u8>,
    regs: RegisterFile,
    hints: Vec<MemoryHint>,
}

/// The (usermode) register file. Only the standard addressable registers,
/// plus `RFLAGS`, are tracked; all segment base addresses are assumed `0`
/// except `FSBASE`/`GSBASE`.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct RegisterFile {
    rax: u64,
    rbx: u64,
    rcx: u64,
    rdx: u64,
    rsi: u64,
    rdi: u64,
    rsp: u64,
    rbp: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    rflags: u64,
    fs_base: u64,
    gs_base: u64,
}

impl RegisterFile {
    /// Given a symbolic iced-x86 register, concretize it against the register file.
    /// Untracked registers result in an `Err` result.
    fn value(&self, reg: Register) -> Result<u64> {
        match reg {
            Register::AL => Ok((self.rax as u8).into()),
            Register::BL => Ok((self.rbx as u8).into()),
            Register::CL => Ok((self.rcx as u8).into()),
            Register::DL => Ok((self.rdx as u8).into()),
            Register::AH => Ok(((self.rax >> 8) as u8).into()),
            Register::BH => Ok(((self.rbx >> 8) as u8).into()),
            Register::CH => Ok(((self.rcx >> 8) as u8).into()),
            Register::DH => Ok(((self.rdx >> 8) as u8).into()),

            Register::AX => Ok((self.rax as u16).into()),
            Register::BX => Ok((self.rbx as u16).into()),
            Register::CX => Ok((self.rcx as u16).into()),
            Register::DX => Ok((self.rdx as u16).into()),
            Register::SI => Ok((self.rsi as u16).into()),
            Register::DI => Ok((self.rdi as u16).into()),
            Register::SP => Ok((self.rsp as u16).into()),
            Register::BP => Ok((self.rbp as u16).into()),

            Register::EAX => Ok((self.rax as u32).into()),
            Register::EBX => Ok((self.rbx as u32).into()),
            Register::ECX => Ok((self.rcx as u32).into()),
            Register::EDX => Ok((self.rdx as u32).into()),
            Register::ESI => Ok((self.rsi as u32).into()),
            Register::EDI => Ok((self.rdi as u32).into()),
            Register::ESP => Ok((self.rsp as u32).into()),
            Register::EBP => Ok((self.rbp as u32).into()),
            Register::EIP => Ok((self.rip as u32).into()),

            Register::RAX => Ok(self.rax),
            Register::RBX => Ok(self.rbx),
            Register::RCX => Ok(self.rcx),
            Register::RDX => Ok(self.rdx),
            Register::RSI => Ok(self.rsi),
            Register::RDI => Ok(self.rdi),
            Register::RSP => Ok(self.rsp),
            Register::RBP => Ok(self.rbp),
            Register::R8 => Ok(self.r8),
            Register::R9 => Ok(self.r9),
            Register::R10 => Ok(self.r10),
            Register::R11 => Ok(self.r11),
            Register::R12 => Ok(self.r12),
            Register::R13 => Ok(self.r13),
            Register::R14 => Ok(self.r14),
            Register::R15 => Ok(self.r15),
            Register::RIP => Ok(self.rip),

            Register::FS => Ok(self.fs_base),
            Register::GS => Ok(self.gs_base),
            Register::SS | Register::CS | Register::DS | Register::ES => Ok(0),

            _ => Err(anyhow!("untracked register requested: {:?}", reg)),
        }
    }
}

impl From<libc::user_regs_struct> for RegisterFile {
    fn from(user_regs: libc::user_regs_struct) -> Self {
        Self {
            rax: user_regs.rax,
            rbx: user_regs.rbx,
            rcx: user_regs.rcx,
            rdx: user_regs.rdx,
            rsi: user_regs.rsi,
            rdi: user_regs.rdi,
            rsp: user_regs.rsp,
            rbp: user_regs.rbp,
            r8: user_regs.r8,
            r9: user_regs.r9,
            r10: user_regs.r10,
            r11: user_regs.r11,
            r12: user_regs.r12,
            r13: user_regs.r13,
            r14: user_regs.r14,
            r15: user_regs.r15,
            rip: user_regs.rip,
            rflags: user_regs.eflags,
            fs_base: user_regs.fs_base,
            gs_base: user_regs.gs_base,
        }
    }
}

/// An actively traced program, in some indeterminate state. Tracees are
/// associated with their parent `Tracer`.
pub struct Tracee<'a> {
    terminated: bool,
    tracee_pid: Pid,
    tracer: &'a Tracer,
    info_factory: InstructionInfoFactory,
    register_file: RegisterFile,
    executable_pages: RangeMap<u64, Vec<u8>>,
}

impl<'a> Tracee<'a> {
    fn new(tracee_pid: Pid, tracer: &'a Tracer) -> Result<Self> {
        let mut tracee = Self {
            terminated: false,
            tracee_pid,
            tracer,
            info_factory: InstructionInfoFactory::new(),
            register_file: Default::default(),
            executable_pages: Default::default(),
        };

        tracee.find_exec_pages()?;

        Ok(tracee)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Steps the tracee forward by one instruction, returning the raw trace
    /// `Step`. The taint engine is driven by the caller through this
    /// tracee's `ProcessorView` implementation on each step, not by this
    /// method's return value.
    pub fn step(&mut self) -> Result<Step> {
        self.tracee_regs()?;
        let (instr, instr_bytes) = self.tracee_instr()?;

        let mut hints = self.tracee_hints_stage1(&instr)?;

        ptrace::step(self.tracee_pid, None)?;

        self.tracee_hints_stage2(&mut hints)?;

        match wait::waitpid(self.tracee_pid, None)? {
            wait::WaitStatus::Exited(_, status) => {
                log::debug!("exited with {}", status);
                self.terminated = true;
            }
            wait::WaitStatus::Signaled(_, _, _) => {
                log::debug!("signaled");
            }
            wait::WaitStatus::Stopped(_, signal) => {
                log::debug!("stopped with {:?}", signal);
            }
            wait::WaitStatus::StillAlive => {
                log::debug!("still alive");
            }
            s => {
                log::debug!("{:?}", s);
                self.terminated = true;
            }
        }

        Ok(Step {
            instr: instr_bytes[0..instr.len()].to_vec(),
            regs: self.register_file,
            hints,
        })
    }

    fn tracee_regs(&mut self) -> Result<()> {
        self.register_file = RegisterFile::from(ptrace::getregs(self.tracee_pid)?);
        Ok(())
    }

    fn tracee_instr(&self) -> Result<(Instruction, Vec<u8>)> {
        let mut bytes = vec![0u8; MAX_INSTR_LEN];
        let remote_iov = uio::RemoteIoVec {
            base: self.register_file.rip as usize,
            len: MAX_INSTR_LEN,
        };

        uio::process_vm_readv(
            self.tracee_pid,
            &[uio::IoVec::from_mut_slice(&mut bytes)],
            &[remote_iov],
        )?;

        let mut decoder = Decoder::new(self.tracer.bitness, &bytes, DecoderOptions::NONE);
        decoder.set_ip(self.register_file.rip);

        let instr = decoder.decode();

        match instr.code() {
            Code::INVALID => Err(anyhow!("invalid instruction")),
            _ => Ok((instr, bytes)),
        }
    }

    fn tracee_data_by_mask(&self, addr: u64, mask: MemoryMask) -> Result<u64> {
        let bytes = self.tracee_data(addr, mask as usize)?;

        Ok(match mask {
            MemoryMask::Byte => bytes[0] as u64,
            MemoryMask::Word => u16::from_le_bytes(bytes.as_slice().try_into()?) as u64,
            MemoryMask::DWord => u32::from_le_bytes(bytes.as_slice().try_into()?) as u64,
            MemoryMask::QWord => u64::from_le_bytes(bytes.as_slice().try_into()?) as u64,
        })
    }

    fn tracee_data(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; size];
        let remote_iov = uio::RemoteIoVec {
            base: addr as usize,
            len: size,
        };

        if let Err(e) = uio::process_vm_readv(
            self.tracee_pid,
            &[uio::IoVec::from_mut_slice(&mut bytes)],
            &[remote_iov],
        ) {
            if self.tracer.debug_on_fault {
                log::error!("Suspending the tracee ({}), detaching and exiting", self.tracee_pid);
                ptrace::detach(self.tracee_pid, Some(signal::Signal::SIGSTOP))?;
            }

            return Err(e).with_context(|| format!("Fault: size: {:?}, address: {:x}", size, addr));
        }

        Ok(bytes)
    }

    fn find_exec_pages(&mut self) -> Result<()> {
        for map in rsprocmaps::from_pid(self.tracee_pid.as_raw())? {
            let map = map?;
            if !map.permissions.executable {
                continue;
            }

            let exec_range = {
                let size = map.address_range.end - map.address_range.begin;
                self.tracee_data(map.address_range.begin, size as usize)?
            };

            self.executable_pages.insert(map.address_range.begin..map.address_range.end, exec_range);
        }

        Ok(())
    }

    fn mask_from_str_instr(&self, instr: &Instruction) -> Result<MemoryMask> {
        Ok(match instr.mnemonic() {
            Mnemonic::Lodsb | Mnemonic::Stosb | Mnemonic::Movsb | Mnemonic::Cmpsb | Mnemonic::Scasb => {
                MemoryMask::Byte
            }
            Mnemonic::Lodsw | Mnemonic::Stosw | Mnemonic::Movsw | Mnemonic::Cmpsw | Mnemonic::Scasw => {
                MemoryMask::Word
            }
            Mnemonic::Lodsd | Mnemonic::Stosd | Mnemonic::Movsd | Mnemonic::Cmpsd | Mnemonic::Scasd => {
                MemoryMask::DWord
            }
            Mnemonic::Lodsq | Mnemonic::Stosq | Mnemonic::Movsq | Mnemonic::Cmpsq | Mnemonic::Scasq => {
                MemoryMask::QWord
            }
            _ => return Err(anyhow!("unknown mask for instruction: {:?}", instr.code())),
        })
    }

    fn tracee_hints_stage1(&mut self, instr: &Instruction) -> Result<Vec<MemoryHint>> {
        let mut hints = vec![];

        let info = self
            .info_factory
            .info_options(instr, InstructionInfoOptions::NO_REGISTER_USAGE)
            .clone();

        for used_mem in info.used_memory() {
            let ops: &[MemoryOp] = match used_mem.access() {
                OpAccess::Read | OpAccess::CondRead => &[MemoryOp::Read],
                OpAccess::Write | OpAccess::CondWrite => &[MemoryOp::Write],
                OpAccess::ReadWrite | OpAccess::ReadCondWrite => &[MemoryOp::Read, MemoryOp::Write],
                op => return Err(anyhow!("unsupported memop: {:?}", op)),
            };

            let mask = match used_mem.memory_size() {
                MemorySize::UInt8 | MemorySize::Int8 => MemoryMask::Byte,
                MemorySize::UInt16 | MemorySize::Int16 => MemoryMask::Word,
                MemorySize::UInt32 | MemorySize::Int32 => MemoryMask::DWord,
                MemorySize::UInt64 | MemorySize::Int64 => MemoryMask::QWord,
                MemorySize::Unknown => self.mask_from_str_instr(instr)?,
                size => {
                    if self.tracer.ignore_unsupported_memops {
                        log::warn!("unsupported memop size: {:?}: not generating a memory hint", size);
                        continue;
                    } else {
                        return Err(anyhow!("unsupported memsize: {:?}", size));
                    }
                }
            };

            let addr = used_mem
                .try_virtual_address(0, |reg, _, _| self.register_file.value(reg).ok())
                .ok_or_else(|| anyhow!("effective address calculation failed"))?;

            for op in ops {
                let data = match op {
                    MemoryOp::Read => self.tracee_data_by_mask(addr, mask)?,
                    MemoryOp::Write => 0,
                };

                hints.push(MemoryHint {
                    address: addr,
                    operation: *op,
                    mask,
                    data,
                });
            }
        }

        Ok(hints)
    }

    fn tracee_hints_stage2(&self, hints: &mut Vec<MemoryHint>) -> Result<()> {
        // Fast-string-operation execution can reorder stores past this point
        // on some CPUs; sleeping briefly gives them a chance to land before
        // we read them back.
        std::thread::sleep(std::time::Duration::from_millis(1));

        for hint in hints.iter_mut() {
            if hint.operation != MemoryOp::Write {
                continue;
            }

            hint.data = self.tracee_data_by_mask(hint.address, hint.mask)?;
        }

        Ok(())
    }
}

impl Iterator for Tracee<'_> {
    type Item = Result<Step>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.terminated {
            None
        } else {
            Some(self.step())
        }
    }
}

fn gpr_from_regs(regs: &RegisterFile, reg: Gpr) -> u32 {
    match reg {
        Gpr::Eax => regs.rax as u32,
        Gpr::Ecx => regs.rcx as u32,
        Gpr::Edx => regs.rdx as u32,
        Gpr::Ebx => regs.rbx as u32,
        Gpr::Esp => regs.rsp as u32,
        Gpr::Ebp => regs.rbp as u32,
        Gpr::Esi => regs.rsi as u32,
        Gpr::Edi => regs.rdi as u32,
    }
}

impl<'a> ProcessorView for Tracee<'a> {
    fn eip(&self) -> u32 {
        self.register_file.rip as u32
    }

    fn gpr(&self, reg: Gpr) -> u32 {
        gpr_from_regs(&self.register_file, reg)
    }

    fn flags(&self) -> u32 {
        self.register_file.rflags as u32
    }

    fn section_containing(&self, addr: u32) -> Option<MemorySection> {
        let (range, _) = self.executable_pages.get_key_value(&(addr as u64))?;
        Some(MemorySection {
            base: range.start as u32,
            size: (range.end - range.start) as u32,
            description: "executable mapping".to_string(),
        })
    }

    fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        match self.executable_pages.get_key_value(&(addr as u64)) {
            Some((range, bytes)) if (addr as u64) >= range.start => {
                let off = (addr as u64 - range.start) as usize;
                if off >= bytes.len() {
                    Vec::new()
                } else {
                    let end = (off + len).min(bytes.len());
                    bytes[off..end].to_vec()
                }
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Tracer {
    pub ignore_unsupported_memops: bool,
    pub debug_on_fault: bool,
    pub bitness: u32,
    pub tracee_pid: Option<Pid>,
    pub tracee_name: Option<String>,
    pub tracee_args: Vec<String>,
}

impl Tracer {
    pub fn trace(&self) -> Result<Tracee> {
        let tracee_pid = if let Some(tracee_name) = &self.tracee_name {
            let child = Command::new(&tracee_name).args(&self.tracee_args).spawn_ptrace()?;

            log::debug!("spawned {} for tracing as child {}", tracee_name, child.id());

            Pid::from_raw(child.id() as i32)
        } else {
            let tracee_pid = self.tracee_pid.unwrap();
            ptrace::attach(tracee_pid)?;
            tracee_pid
        };

        // Stop right before the tracee finally exits, giving us one last
        // chance to do some inspection.
        ptrace::setoptions(tracee_pid, ptrace::Options::PTRACE_O_TRACEEXIT)?;

        Tracee::new(tracee_pid, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_regs() -> RegisterFile {
        RegisterFile {
            rax: 0x9900aabbccddeeff,
            rdi: 0x00000000feedface,
            ..Default::default()
        }
    }

    #[test]
    fn register_file_value_narrows_correctly() {
        let regs = dummy_regs();

        assert_eq!(regs.value(Register::AL).unwrap(), 0xff);
        assert_eq!(regs.value(Register::AH).unwrap(), 0xee);
        assert_eq!(regs.value(Register::AX).unwrap(), 0xeeff);
        assert_eq!(regs.value(Register::EAX).unwrap(), 0xccddeeff);
        assert_eq!(regs.value(Register::RAX).unwrap(), 0x9900aabbccddeeff);

        assert_eq!(regs.value(Register::SS).unwrap(), 0);
        assert_eq!(regs.value(Register::FS).unwrap(), 0);

        assert!(regs.value(Register::ST0).is_err());
    }

    #[test]
    fn gpr_mapping_matches_register_file_fields() {
        let regs = dummy_regs();
        assert_eq!(gpr_from_regs(&regs, Gpr::Eax), 0xccddeeff);
        assert_eq!(gpr_from_regs(&regs, Gpr::Edi), 0xfeedface);
    }
}
