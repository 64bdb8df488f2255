// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Guest general-purpose register state and the software register cache.
//!
//! Register accesses never touch hardware-consumed storage directly: reads
//! go through the cache and lazily pull the true value in, writes land in
//! the cache and are flushed before the next guest entry. The `available`
//! and `dirty` bitmaps implement that discipline.

use bit_field::BitField;

numeric_enum_macro::numeric_enum! {
    #[repr(u8)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Index of a cached guest register. The numbering matches the hardware
    /// GPR encoding, with RIP appended.
    pub enum GuestReg {
        Rax = 0,
        Rcx = 1,
        Rdx = 2,
        Rbx = 3,
        Rsp = 4,
        Rbp = 5,
        Rsi = 6,
        Rdi = 7,
        R8 = 8,
        R9 = 9,
        R10 = 10,
        R11 = 11,
        R12 = 12,
        R13 = 13,
        R14 = 14,
        R15 = 15,
        Rip = 16,
    }
}

/// Number of register slots tracked by the cache (16 GPRs plus RIP).
pub const NR_GUEST_REGS: usize = 17;

/// Extra availability bits for register classes cached outside the GPR
/// array. They share the cache's `available` bitmap above the GPR slots.
pub const EXREG_PDPTR: usize = 17;
pub const EXREG_CR3: usize = 18;
pub const EXREG_RFLAGS: usize = 19;
pub const EXREG_SEGMENTS: usize = 20;

/// Guest general-purpose registers as saved and restored by the entry/exit
/// trampoline around `VMRUN`.
///
/// RAX and RSP are not part of this block: `VMRUN`/`#VMEXIT` exchange them
/// through the VMCB state-save area instead.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// Register names indexed by their hardware encoding.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the register with the given hardware index.
    ///
    /// Index 4 (RSP) lives in the VMCB, not in this block, and is rejected
    /// like an out-of-range index.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters: {}", index),
        }
    }

    /// Sets the value of the register with the given hardware index.
    ///
    /// See [`GeneralRegisters::get_reg_of_index`] for the index rules.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters: {}", index),
        }
    }
}

/// Software cache over the guest register file.
///
/// Invariant: a slot is never read unless its `available` bit is set, and a
/// slot is never pushed to hardware state unless its `dirty` bit is set.
/// Both bits are cleared together when a flush retires the cached value.
#[derive(Debug, Default)]
pub struct RegisterCache {
    values: [u64; NR_GUEST_REGS],
    avail: u32,
    dirty: u32,
}

impl RegisterCache {
    pub const fn new() -> Self {
        Self {
            values: [0; NR_GUEST_REGS],
            avail: 0,
            dirty: 0,
        }
    }

    #[inline]
    pub fn is_avail(&self, reg: GuestReg) -> bool {
        self.avail.get_bit(reg as usize)
    }

    #[inline]
    pub fn is_dirty(&self, reg: GuestReg) -> bool {
        self.dirty.get_bit(reg as usize)
    }

    /// Reads a cached value. Reading a slot whose `available` bit is clear
    /// is a caller bug and fails loudly instead of returning stale data.
    pub fn read(&self, reg: GuestReg) -> u64 {
        assert!(
            self.is_avail(reg),
            "read of unavailable guest register {:?}",
            reg
        );
        self.values[reg as usize]
    }

    /// Installs a value fetched from hardware state: marks the slot
    /// available without dirtying it.
    pub fn fill(&mut self, reg: GuestReg, value: u64) {
        self.values[reg as usize] = value;
        self.avail.set_bit(reg as usize, true);
    }

    /// Caches a guest-visible write: the slot becomes available and dirty.
    pub fn write(&mut self, reg: GuestReg, value: u64) {
        self.values[reg as usize] = value;
        self.avail.set_bit(reg as usize, true);
        self.dirty.set_bit(reg as usize, true);
    }

    /// Hands every dirty slot to `flush` and retires it: both bitmaps are
    /// cleared for the flushed values, so the next read re-fetches.
    pub fn flush_dirty(&mut self, mut flush: impl FnMut(GuestReg, u64)) {
        let dirty = self.dirty;
        for index in 0..NR_GUEST_REGS {
            if dirty.get_bit(index) {
                let reg = GuestReg::try_from(index as u8).unwrap();
                flush(reg, self.values[index]);
                self.avail.set_bit(index, false);
                self.dirty.set_bit(index, false);
            }
        }
    }

    /// Drops all cached values, available and dirty alike. Used after a
    /// guest exit when hardware state has become the source of truth.
    pub fn invalidate(&mut self) {
        self.avail = 0;
        self.dirty = 0;
    }

    #[inline]
    pub fn is_ex_avail(&self, exreg: usize) -> bool {
        debug_assert!((NR_GUEST_REGS..32).contains(&exreg));
        self.avail.get_bit(exreg)
    }

    #[inline]
    pub fn set_ex_avail(&mut self, exreg: usize, avail: bool) {
        debug_assert!((NR_GUEST_REGS..32).contains(&exreg));
        self.avail.set_bit(exreg, avail);
    }
}
