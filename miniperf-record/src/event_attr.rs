use std::io::{Read, Write};

use bitflags::bitflags;
use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt};

use crate::error::ReadError;

pub const EVENT_TYPE_HARDWARE: u32 = 0;
pub const EVENT_TYPE_SOFTWARE: u32 = 1;
pub const EVENT_TYPE_TRACEPOINT: u32 = 2;
pub const EVENT_TYPE_HW_CACHE: u32 = 3;
pub const EVENT_TYPE_RAW: u32 = 4;
/// Reserved private type for samplers that run entirely in user space.
/// The kernel never sees attrs of this type.
pub const EVENT_TYPE_USER_SPACE_SAMPLER: u32 = 0x7fff_ffff;

/// Size of the attr struct up to and including `clock_id` (ABI version 3).
pub const ATTR_SIZE_VER3: u32 = 96;
const ATTR_SIZE_VER0: u32 = 64;

bitflags! {
    /// Selector mask choosing which optional fields accompany a sample.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SampleFormat: u64 {
        const IP = 1 << 0;
        const TID = 1 << 1;
        const TIME = 1 << 2;
        const ADDR = 1 << 3;
        const READ = 1 << 4;
        const CALLCHAIN = 1 << 5;
        const ID = 1 << 6;
        const CPU = 1 << 7;
        const PERIOD = 1 << 8;
        const STREAM_ID = 1 << 9;
        const RAW = 1 << 10;
        const BRANCH_STACK = 1 << 11;
        const REGS_USER = 1 << 12;
        const STACK_USER = 1 << 13;
        const IDENTIFIER = 1 << 16;
    }
}

bitflags! {
    /// Layout of the values returned by reading a counter fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReadFormat: u64 {
        const TOTAL_TIME_ENABLED = 1 << 0;
        const TOTAL_TIME_RUNNING = 1 << 1;
        const ID = 1 << 2;
        const GROUP = 1 << 3;
    }
}

bitflags! {
    /// The packed flag bitfield of the attr struct. `precise_ip` occupies
    /// bits 15-16 and is exposed through an accessor instead.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u64 {
        const DISABLED = 1 << 0;
        const INHERIT = 1 << 1;
        const PINNED = 1 << 2;
        const EXCLUSIVE = 1 << 3;
        const EXCLUDE_USER = 1 << 4;
        const EXCLUDE_KERNEL = 1 << 5;
        const EXCLUDE_HV = 1 << 6;
        const EXCLUDE_IDLE = 1 << 7;
        const MMAP = 1 << 8;
        const COMM = 1 << 9;
        const FREQ = 1 << 10;
        const INHERIT_STAT = 1 << 11;
        const ENABLE_ON_EXEC = 1 << 12;
        const TASK = 1 << 13;
        const WATERMARK = 1 << 14;
        const PRECISE_IP_LO = 1 << 15;
        const PRECISE_IP_HI = 1 << 16;
        const MMAP_DATA = 1 << 17;
        const SAMPLE_ID_ALL = 1 << 18;
        const EXCLUDE_HOST = 1 << 19;
        const EXCLUDE_GUEST = 1 << 20;
        const EXCLUDE_CALLCHAIN_KERNEL = 1 << 21;
        const EXCLUDE_CALLCHAIN_USER = 1 << 22;
        const MMAP2 = 1 << 23;
        const COMM_EXEC = 1 << 24;
        const USE_CLOCKID = 1 << 25;
        const CONTEXT_SWITCH = 1 << 26;
    }
}

/// Configuration descriptor for one perf event, in the shape the kernel and
/// the record file share.
///
/// This is the codec-side view; the syscall-side `#[repr(C)]` struct lives in
/// the tool crate and is built from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAttr {
    pub event_type: u32,
    pub config: u64,
    /// Period when `FREQ` is unset, frequency when it is set.
    pub sample_period_or_freq: u64,
    pub sample_type: SampleFormat,
    pub read_format: ReadFormat,
    pub flags: AttrFlags,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub bp_addr_or_config1: u64,
    pub bp_len_or_config2: u64,
    pub branch_sample_type: u64,
    /// Bit mask of user registers captured with each sample.
    pub sample_regs_user: u64,
    /// Bytes of user stack captured with each sample.
    pub sample_stack_user: u32,
    pub clock_id: i32,
}

impl EventAttr {
    pub fn sample_id_all(&self) -> bool {
        self.flags.contains(AttrFlags::SAMPLE_ID_ALL)
    }

    /// Skid constraint level, 0..=3.
    pub fn precise_ip(&self) -> u8 {
        ((self.flags.bits() >> 15) & 0x3) as u8
    }

    pub fn set_precise_ip(&mut self, level: u8) {
        let bits = (self.flags.bits() & !(0x3 << 15)) | ((level as u64 & 0x3) << 15);
        self.flags = AttrFlags::from_bits_retain(bits);
    }

    /// Number of set bits in the user register mask, which is the number of
    /// u64 register values a sample carries when its abi field is nonzero.
    pub fn user_regs_count(&self) -> usize {
        self.sample_regs_user.count_ones() as usize
    }

    /// Parse an attr struct, honoring its self-declared size. Returns the
    /// attr and the size consumed, so callers can walk attr arrays with
    /// nonstandard strides.
    pub fn parse<R: Read, T: ByteOrder>(mut reader: R) -> Result<(Self, u64), ReadError> {
        let event_type = reader.read_u32::<T>().map_err(|_| ReadError::EventAttr)?;
        let size = reader.read_u32::<T>().map_err(|_| ReadError::EventAttr)?;
        if size < ATTR_SIZE_VER0 {
            return Err(ReadError::EventAttr);
        }
        let config = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
        let sample_period_or_freq = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
        let sample_type = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
        let read_format = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
        let flags = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
        let wakeup_events = reader.read_u32::<T>().map_err(|_| ReadError::EventAttr)?;
        let bp_type = reader.read_u32::<T>().map_err(|_| ReadError::EventAttr)?;
        let bp_addr_or_config1 = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
        let mut consumed = ATTR_SIZE_VER0 as u64;

        let mut bp_len_or_config2 = 0;
        let mut branch_sample_type = 0;
        let mut sample_regs_user = 0;
        let mut sample_stack_user = 0;
        let mut clock_id = 0;
        if size >= 72 {
            bp_len_or_config2 = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
            consumed = 72;
        }
        if size >= 80 {
            branch_sample_type = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
            consumed = 80;
        }
        if size >= 88 {
            sample_regs_user = reader.read_u64::<T>().map_err(|_| ReadError::EventAttr)?;
            consumed = 88;
        }
        if size >= ATTR_SIZE_VER3 {
            sample_stack_user = reader.read_u32::<T>().map_err(|_| ReadError::EventAttr)?;
            clock_id = reader.read_i32::<T>().map_err(|_| ReadError::EventAttr)?;
            consumed = ATTR_SIZE_VER3 as u64;
        }
        // Skip fields from attr versions newer than we know about.
        let mut remaining = size as u64 - consumed;
        let mut scratch = [0u8; 8];
        while remaining > 0 {
            let chunk = remaining.min(8) as usize;
            reader
                .read_exact(&mut scratch[..chunk])
                .map_err(|_| ReadError::EventAttr)?;
            remaining -= chunk as u64;
        }

        let attr = EventAttr {
            event_type,
            config,
            sample_period_or_freq,
            sample_type: SampleFormat::from_bits_retain(sample_type),
            read_format: ReadFormat::from_bits_retain(read_format),
            flags: AttrFlags::from_bits_retain(flags),
            wakeup_events,
            bp_type,
            bp_addr_or_config1,
            bp_len_or_config2,
            branch_sample_type,
            sample_regs_user,
            sample_stack_user,
            clock_id,
        };
        Ok((attr, size as u64))
    }

    pub fn encode<W: Write, T: ByteOrder>(&self, mut w: W) -> std::io::Result<()> {
        w.write_u32::<T>(self.event_type)?;
        w.write_u32::<T>(ATTR_SIZE_VER3)?;
        w.write_u64::<T>(self.config)?;
        w.write_u64::<T>(self.sample_period_or_freq)?;
        w.write_u64::<T>(self.sample_type.bits())?;
        w.write_u64::<T>(self.read_format.bits())?;
        w.write_u64::<T>(self.flags.bits())?;
        w.write_u32::<T>(self.wakeup_events)?;
        w.write_u32::<T>(self.bp_type)?;
        w.write_u64::<T>(self.bp_addr_or_config1)?;
        w.write_u64::<T>(self.bp_len_or_config2)?;
        w.write_u64::<T>(self.branch_sample_type)?;
        w.write_u64::<T>(self.sample_regs_user)?;
        w.write_u32::<T>(self.sample_stack_user)?;
        w.write_i32::<T>(self.clock_id)?;
        Ok(())
    }
}

impl Default for EventAttr {
    fn default() -> Self {
        EventAttr {
            event_type: EVENT_TYPE_SOFTWARE,
            config: 0,
            sample_period_or_freq: 0,
            sample_type: SampleFormat::empty(),
            read_format: ReadFormat::empty(),
            flags: AttrFlags::empty(),
            wakeup_events: 0,
            bp_type: 0,
            bp_addr_or_config1: 0,
            bp_len_or_config2: 0,
            branch_sample_type: 0,
            sample_regs_user: 0,
            sample_stack_user: 0,
            clock_id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::NativeEndian;

    #[test]
    fn attr_roundtrip() {
        let mut attr = EventAttr {
            event_type: EVENT_TYPE_HARDWARE,
            config: 0,
            sample_period_or_freq: 4000,
            sample_type: SampleFormat::IP | SampleFormat::TID | SampleFormat::TIME,
            read_format: ReadFormat::ID
                | ReadFormat::TOTAL_TIME_ENABLED
                | ReadFormat::TOTAL_TIME_RUNNING,
            flags: AttrFlags::FREQ | AttrFlags::SAMPLE_ID_ALL | AttrFlags::MMAP,
            wakeup_events: 1,
            sample_regs_user: 0xff,
            sample_stack_user: 8192,
            ..Default::default()
        };
        attr.set_precise_ip(2);

        let mut buf = Vec::new();
        attr.encode::<_, NativeEndian>(&mut buf).unwrap();
        assert_eq!(buf.len(), ATTR_SIZE_VER3 as usize);

        let (parsed, size) = EventAttr::parse::<_, NativeEndian>(&buf[..]).unwrap();
        assert_eq!(size, ATTR_SIZE_VER3 as u64);
        assert_eq!(parsed, attr);
        assert_eq!(parsed.precise_ip(), 2);
        assert_eq!(parsed.user_regs_count(), 8);
    }

    #[test]
    fn attr_parse_rejects_truncated() {
        let buf = [0u8; 32];
        assert!(EventAttr::parse::<_, NativeEndian>(&buf[..]).is_err());
    }

    #[test]
    fn attr_parse_skips_unknown_tail() {
        let attr = EventAttr::default();
        let mut buf = Vec::new();
        attr.encode::<_, NativeEndian>(&mut buf).unwrap();
        // Claim a larger, newer attr size and append the extra bytes.
        buf[4] = 112;
        buf.extend_from_slice(&[0u8; 16]);
        let (parsed, size) = EventAttr::parse::<_, NativeEndian>(&buf[..]).unwrap();
        assert_eq!(size, 112);
        assert_eq!(parsed, attr);
    }
}
