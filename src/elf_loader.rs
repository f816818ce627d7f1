//! ELF32 executable loader and user-stack construction (§4.1)
//!
//! Out of scope (§1): the ELF specification itself — only the fields this
//! loader consumes are validated. The physical page allocator and the
//! page-directory abstraction are likewise external collaborators; this
//! module only calls through `UserAddressSpace`.

use alloc::vec::Vec;

use elf::abi::{PF_W, PT_DYNAMIC, PT_INTERP, PT_LOAD, PT_NOTE, PT_NULL, PT_PHDR, PT_SHLIB};
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::config::{PAGE_SIZE, PHYS_BASE};
use crate::mmu::{user_flags, UserAddressSpace};
use crate::vfs::{self, OpenFile};

/// `PT_GNU_STACK`, ignored like `PT_NULL`/`PT_NOTE`/`PT_PHDR` (§4.1 step 5).
/// Not in `elf::abi` as a named constant for 32-bit targets, so spelled out.
const PT_GNU_STACK: u32 = 0x6474_e551;

const EM_386: u16 = 3;
const ET_EXEC: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    FileNotFound,
    InvalidMagic,
    WrongClass,
    WrongType,
    WrongMachine,
    BadProgramHeader,
    SegmentEscapesUserSpace,
    SegmentMapsPageZero,
    SegmentOffsetBeyondEof,
    SegmentAlreadyMapped,
    RejectedSegmentType,
    OutOfMemory,
    MappingFailed,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            LoadError::FileNotFound => "file not found",
            LoadError::InvalidMagic => "not an ELF file",
            LoadError::WrongClass => "not a 32-bit ELF",
            LoadError::WrongType => "not an executable",
            LoadError::WrongMachine => "wrong machine type (expected i386)",
            LoadError::BadProgramHeader => "malformed program header",
            LoadError::SegmentEscapesUserSpace => "segment escapes user address space",
            LoadError::SegmentMapsPageZero => "segment would map page 0",
            LoadError::SegmentOffsetBeyondEof => "segment offset beyond end of file",
            LoadError::SegmentAlreadyMapped => "segment overlaps an already-mapped page",
            LoadError::RejectedSegmentType => "unsupported program header type",
            LoadError::OutOfMemory => "out of memory",
            LoadError::MappingFailed => "failed to map segment",
        };
        write!(f, "{msg}")
    }
}

/// Everything `start_process` needs after a successful load: where to jump,
/// what the initial `esp` is, and the open executable handle (kept around
/// with writes denied for the process's lifetime).
pub struct LoadResult {
    pub entry_point: usize,
    pub esp: usize,
    pub exe_file: OpenFile,
}

/// First whitespace-delimited token of the command line — the program name
/// used to open the executable (§4.1 step 2).
fn program_name(cmdline: &str) -> &str {
    cmdline.split(' ').next().unwrap_or(cmdline)
}

/// Loads `cmdline`'s program into `space` and builds the initial stack.
/// `space` must already be activated on the current thread (§4.1 step 1 is
/// the caller's responsibility — it precedes opening the file so that page
/// faults during the read, if any, resolve against the right directory).
pub fn load(cmdline: &str, space: &mut UserAddressSpace) -> Result<LoadResult, LoadError> {
    let name = program_name(cmdline);
    let mut exe_file = vfs::open(name).map_err(|_| LoadError::FileNotFound)?;
    exe_file.deny_write();

    let data = exe_file.read_all();
    let elf = ElfBytes::<LittleEndian>::minimal_parse(&data).map_err(|_| LoadError::InvalidMagic)?;

    if elf.ehdr.class != Class::ELF32 {
        return Err(LoadError::WrongClass);
    }
    if elf.ehdr.e_type != ET_EXEC {
        return Err(LoadError::WrongType);
    }
    if elf.ehdr.e_machine != EM_386 {
        return Err(LoadError::WrongMachine);
    }

    let segments = elf.segments().ok_or(LoadError::BadProgramHeader)?;
    for phdr in segments.iter() {
        match phdr.p_type {
            PT_NULL | PT_NOTE | PT_PHDR | PT_GNU_STACK => continue,
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(LoadError::RejectedSegmentType),
            PT_LOAD => load_segment(&phdr, &data, space)?,
            _ => continue,
        }
    }

    let stack_page_va = PHYS_BASE - PAGE_SIZE;
    let stack_frame = space
        .alloc_and_map(stack_page_va, user_flags::RW)
        .map_err(|_| LoadError::OutOfMemory)?;

    let esp = build_argv_frame(cmdline, stack_frame, stack_page_va);

    crate::log_load!(crate::log::Level::Debug, "{}: loaded, entry {:#x}", name, elf.ehdr.e_entry);

    Ok(LoadResult {
        entry_point: elf.ehdr.e_entry as usize,
        esp,
        exe_file,
    })
}

fn load_segment(
    phdr: &elf::segment::ProgramHeader,
    file_data: &[u8],
    space: &mut UserAddressSpace,
) -> Result<(), LoadError> {
    let p_offset = phdr.p_offset as usize;
    let p_vaddr = phdr.p_vaddr as usize;
    let p_filesz = phdr.p_filesz as usize;
    let p_memsz = phdr.p_memsz as usize;

    if p_offset % PAGE_SIZE != p_vaddr % PAGE_SIZE {
        return Err(LoadError::BadProgramHeader);
    }
    if p_offset > file_data.len() {
        return Err(LoadError::SegmentOffsetBeyondEof);
    }
    if p_memsz < p_filesz || p_memsz == 0 {
        return Err(LoadError::BadProgramHeader);
    }
    if p_vaddr < PAGE_SIZE {
        return Err(LoadError::SegmentMapsPageZero);
    }
    let end = p_vaddr
        .checked_add(p_memsz)
        .ok_or(LoadError::SegmentEscapesUserSpace)?;
    if end > PHYS_BASE || end < p_vaddr {
        return Err(LoadError::SegmentEscapesUserSpace);
    }

    let writable = phdr.p_flags & PF_W != 0;
    let page_flags = if writable { user_flags::RW } else { user_flags::RX };

    let page_start = p_vaddr & !(PAGE_SIZE - 1);
    let page_end = (p_vaddr + p_memsz).div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let mut page_va = page_start;
    while page_va < page_end {
        let frame = space
            .alloc_and_map(page_va, page_flags)
            .map_err(|_| LoadError::SegmentAlreadyMapped)?;

        let kernel_page = crate::mmu::phys_to_virt(frame.addr);
        unsafe {
            core::ptr::write_bytes(kernel_page, 0, PAGE_SIZE);
        }

        // Bytes of this page that fall within [p_vaddr, p_vaddr + p_filesz).
        let seg_file_start = p_offset + page_va.saturating_sub(p_vaddr);
        let file_range_start = p_vaddr.max(page_va);
        let file_range_end = (p_vaddr + p_filesz).min(page_va + PAGE_SIZE);
        if file_range_end > file_range_start {
            let copy_len = file_range_end - file_range_start;
            let src_start = seg_file_start;
            let src_end = src_start + copy_len;
            if src_end > file_data.len() {
                return Err(LoadError::SegmentOffsetBeyondEof);
            }
            let dst_offset = file_range_start - page_va;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    file_data[src_start..src_end].as_ptr(),
                    kernel_page.add(dst_offset),
                    copy_len,
                );
            }
        }

        page_va += PAGE_SIZE;
    }

    Ok(())
}

const PTR_SIZE: usize = 4;

/// Lays out the argv/argc frame at the top of the freshly mapped stack page
/// (§4.1 "Argv frame construction"), returning the final, 16-byte aligned
/// user `esp`.
fn build_argv_frame(cmdline: &str, stack_frame: crate::pmm::PhysFrame, stack_page_va: usize) -> usize {
    let kpage = crate::mmu::phys_to_virt(stack_frame.addr);

    // 1. Copy the command line, including its terminator, to the top of
    // the page.
    let cmdline_bytes = cmdline.as_bytes();
    let str_len = cmdline_bytes.len() + 1;
    let str_offset = PAGE_SIZE - str_len;
    unsafe {
        core::ptr::copy_nonoverlapping(cmdline_bytes.as_ptr(), kpage.add(str_offset), cmdline_bytes.len());
        kpage.add(str_offset + cmdline_bytes.len()).write(0);
    }

    // 2. Tokenize in place on spaces, recording each token's offset in the
    // page.
    let mut token_offsets: Vec<usize> = Vec::new();
    let mut in_token = false;
    for i in str_offset..(str_offset + str_len) {
        let byte = unsafe { kpage.add(i).read() };
        if byte == 0 {
            break;
        } else if byte == b' ' {
            if in_token {
                unsafe { kpage.add(i).write(0) };
                in_token = false;
            }
        } else if !in_token {
            token_offsets.push(i);
            in_token = true;
        }
    }
    let argc = token_offsets.len();

    // 3. Alignment padding so the final esp lands 16-byte aligned. The
    // trailing structure is: the argv array (argc entries + a null
    // sentinel), the pointer to argv[0], argc itself, and a zero return
    // address — `(argc + 4)` pointer-sized words in total.
    let consumed_by_string = str_len;
    let trailing_words = argc + 4;
    let total_before_pad = consumed_by_string + trailing_words * PTR_SIZE;
    let pad = (16 - (total_before_pad % 16)) % 16;

    let mut cursor = str_offset - pad;

    // 4. Push the null sentinel (argv[argc]).
    cursor -= PTR_SIZE;
    unsafe {
        (kpage.add(cursor) as *mut u32).write_unaligned(0);
    }

    // 5. Push arguments[0..argc) in source order, then reverse the pushed
    // array in place so argv[0] ends up first.
    for &offset in &token_offsets {
        cursor -= PTR_SIZE;
        let user_ptr = (stack_page_va + offset) as u32;
        unsafe {
            (kpage.add(cursor) as *mut u32).write_unaligned(user_ptr);
        }
    }
    let array_base = cursor;
    unsafe {
        let words = kpage.add(array_base) as *mut u32;
        for i in 0..argc / 2 {
            let a = words.add(i).read_unaligned();
            let b = words.add(argc - 1 - i).read_unaligned();
            words.add(i).write_unaligned(b);
            words.add(argc - 1 - i).write_unaligned(a);
        }
    }

    // 6. Push the pointer to argv[0], then argc, then a zero return
    // address.
    let argv_ptr = (stack_page_va + array_base) as u32;
    cursor -= PTR_SIZE;
    unsafe {
        (kpage.add(cursor) as *mut u32).write_unaligned(argv_ptr);
    }
    cursor -= PTR_SIZE;
    unsafe {
        (kpage.add(cursor) as *mut u32).write_unaligned(argc as u32);
    }
    cursor -= PTR_SIZE;
    unsafe {
        (kpage.add(cursor) as *mut u32).write_unaligned(0);
    }

    // 7. Final esp is the user address of the last pushed word.
    stack_page_va + cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn program_name_splits_on_first_space() {
        assert_eq!(program_name("main arg1 arg2"), "main");
        assert_eq!(program_name("main"), "main");
    }

    #[test]
    fn program_name_empty_cmdline() {
        assert_eq!(program_name(""), "");
    }

    #[test]
    fn load_error_messages_are_distinct() {
        let variants = [
            LoadError::FileNotFound,
            LoadError::InvalidMagic,
            LoadError::WrongClass,
            LoadError::WrongType,
            LoadError::WrongMachine,
            LoadError::BadProgramHeader,
            LoadError::SegmentEscapesUserSpace,
            LoadError::SegmentMapsPageZero,
            LoadError::SegmentOffsetBeyondEof,
            LoadError::SegmentAlreadyMapped,
            LoadError::RejectedSegmentType,
            LoadError::OutOfMemory,
            LoadError::MappingFailed,
        ];
        for (i, a) in variants.iter().enumerate() {
            for (j, b) in variants.iter().enumerate() {
                if i != j {
                    assert_ne!(a.to_string(), b.to_string());
                }
            }
        }
    }
}
