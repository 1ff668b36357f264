
//! The device contract of the codec.
//!
//! The graphics driver itself is not part of this crate. What the codec
//! needs from a device is captured here: a set of subgroup capabilities that
//! `init` checks once, a subgroup width selected per pass at dispatch time,
//! and a single in-order command stream with an explicit fence before the
//! CPU touches any readback data. Passes are executed by a worker pool owned
//! by the device, so every kernel is an ordinary data-parallel loop.

use crate::error::{Error, Result};

/// Subgroup operation classes a device can support,
/// combined into a bit mask.
pub mod subgroup {

    /// Elected invocations and barriers.
    pub const BASIC: u32 = 1 << 0;

    /// `subgroupAll`, `subgroupAny`.
    pub const VOTE: u32 = 1 << 1;

    /// Subgroup-wide reductions and scans.
    pub const ARITHMETIC: u32 = 1 << 2;

    /// `subgroupBallot` and friends.
    pub const BALLOT: u32 = 1 << 3;

    /// Arbitrary lane shuffles.
    pub const SHUFFLE: u32 = 1 << 4;

    /// Lane-relative shuffles (up/down).
    pub const SHUFFLE_RELATIVE: u32 = 1 << 5;

    /// Clustered reductions.
    pub const CLUSTERED: u32 = 1 << 6;
}

/// Every subgroup operation class the encoder pipeline uses.
pub(crate) const REQUIRED_SUBGROUP_OPERATIONS: u32 =
    subgroup::BASIC | subgroup::VOTE | subgroup::ARITHMETIC | subgroup::BALLOT |
    subgroup::SHUFFLE | subgroup::SHUFFLE_RELATIVE | subgroup::CLUSTERED;

/// The subgroup widths a pass may select at dispatch time.
pub const SUBGROUP_WIDTHS: [u32; 4] = [ 16, 32, 64, 128 ];

/// How the dequantizer reaches the uploaded payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PayloadAccess {

    /// The device can read bytes from storage buffers directly.
    Storage8Bit,

    /// No 8-bit storage: the payload is read through
    /// 8/16/32-bit texel buffer views instead.
    TexelBuffer,
}

/// The capabilities of a compute device, as queried once at session init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {

    /// Bit mask of supported [`subgroup`] operation classes.
    pub subgroup_operations: u32,

    /// Smallest selectable subgroup width. A power of two.
    pub min_subgroup_size: u32,

    /// Largest selectable subgroup width. A power of two.
    pub max_subgroup_size: u32,

    /// Whether storage and arithmetic support half floats.
    pub half_float: bool,

    /// Whether storage buffers support 8-bit access.
    pub storage_8bit: bool,

    /// Largest supported texel buffer, in elements.
    /// The fallback payload path needs at least 16M elements.
    pub max_texel_buffer_elements: u32,
}

impl DeviceCaps {

    /// The capabilities of the built-in software device, which supports everything.
    pub fn software() -> Self {
        DeviceCaps {
            subgroup_operations: REQUIRED_SUBGROUP_OPERATIONS,
            min_subgroup_size: 16,
            max_subgroup_size: 128,
            half_float: true,
            storage_8bit: true,
            max_texel_buffer_elements: 1 << 27,
        }
    }

    /// Whether all of the requested subgroup operation classes are supported.
    pub fn supports_subgroup_operations(&self, required: u32) -> bool {
        self.subgroup_operations & required == required
    }

    /// Whether a pass may dispatch with the given subgroup width.
    pub fn supports_subgroup_size(&self, size: u32) -> bool {
        size.is_power_of_two()
            && size >= self.min_subgroup_size
            && size <= self.max_subgroup_size
    }

    /// Choose how the dequantizer will read payload bytes on this device,
    /// or report that it cannot.
    pub(crate) fn payload_access(&self) -> Result<PayloadAccess> {
        if self.storage_8bit {
            Ok(PayloadAccess::Storage8Bit)
        }
        else if self.max_texel_buffer_elements >= 1 << 24 {
            Ok(PayloadAccess::TexelBuffer)
        }
        else {
            Err(Error::unsupported("neither 8-bit storage nor a large texel buffer"))
        }
    }
}

/// A compute device. Owns the worker pool that executes all passes,
/// so kernel execution ends with the session that owns the device handle.
pub struct Device {
    caps: DeviceCaps,
    pool: rayon::ThreadPool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Device")
            .field("caps", &self.caps)
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

impl Device {

    /// Create the built-in software device with full capabilities.
    pub fn software() -> Result<Self> {
        Self::with_caps(DeviceCaps::software())
    }

    /// Create a device with explicitly reduced capabilities.
    /// Useful to exercise the capability gating.
    pub fn with_caps(caps: DeviceCaps) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new().build()
            .map_err(|_| Error::unsupported("cannot spawn compute worker threads"))?;

        Ok(Device { caps, pool })
    }

    /// The capabilities queried at creation.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Open the single in-order command stream of this device.
    pub fn begin_commands(&self) -> CommandBuffer<'_> {
        CommandBuffer { device: self }
    }

    /// Run one compute pass on the worker pool. Blocks until the pass retires,
    /// which is what keeps the intra-frame pass order strictly linear.
    pub(crate) fn dispatch<T: Send>(&self, pass: impl FnOnce() -> T + Send) -> T {
        self.pool.install(pass)
    }
}

/// The single in-order command stream of a device.
///
/// Execution is immediate and serialized: every recorded pass has fully
/// retired before the next one starts, which subsumes the storage barriers
/// between passes. The explicit [`Fence`] keeps call sites shaped like the
/// asynchronous contract.
pub struct CommandBuffer<'device> {
    device: &'device Device,
}

impl std::fmt::Debug for CommandBuffer<'_> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("CommandBuffer").finish()
    }
}

impl<'device> CommandBuffer<'device> {

    /// The device this stream submits to.
    pub fn device(&self) -> &'device Device {
        self.device
    }

    /// Select the subgroup width for the next pass
    /// from the given candidates, preferring earlier entries.
    /// Candidates must come from [`SUBGROUP_WIDTHS`].
    pub(crate) fn select_subgroup_size(&self, candidates: &[u32]) -> Result<u32> {
        candidates.iter().copied()
            .find(|&size| self.device.caps.supports_subgroup_size(size))
            .ok_or_else(|| Error::unsupported("no compatible subgroup size"))
    }

    /// Label the following passes for debugging tools.
    pub(crate) fn begin_region(&self, label: &str) {
        log::trace!("begin region: {}", label);
    }

    /// Close the innermost debug label.
    pub(crate) fn end_region(&self) {
        log::trace!("end region");
    }

    /// Finish recording. All submitted passes have retired
    /// once the returned fence is waited on.
    pub fn finish(self) -> Fence {
        Fence { _private: () }
    }
}

/// Synchronizes the CPU with the command stream.
/// Readback data (block meta, the packed bitstream, decoded planes)
/// must not be touched before waiting on the fence.
#[derive(Debug)]
pub struct Fence {
    _private: (),
}

impl Fence {

    /// Block until every pass submitted before this fence has retired.
    /// The software stream executes eagerly, so this returns immediately.
    pub fn wait(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capability_queries(){
        let caps = DeviceCaps::software();
        assert!(caps.supports_subgroup_operations(REQUIRED_SUBGROUP_OPERATIONS));
        assert!(caps.supports_subgroup_size(16));
        assert!(caps.supports_subgroup_size(128));
        assert!(!caps.supports_subgroup_size(8));
        assert!(!caps.supports_subgroup_size(48));

        let mut crippled = caps;
        crippled.subgroup_operations &= !subgroup::CLUSTERED;
        assert!(!crippled.supports_subgroup_operations(REQUIRED_SUBGROUP_OPERATIONS));
    }

    #[test]
    fn payload_access_fallback(){
        let mut caps = DeviceCaps::software();
        assert_eq!(caps.payload_access().unwrap(), PayloadAccess::Storage8Bit);

        caps.storage_8bit = false;
        assert_eq!(caps.payload_access().unwrap(), PayloadAccess::TexelBuffer);

        caps.max_texel_buffer_elements = 1 << 20;
        assert!(caps.payload_access().is_err());
    }

    #[test]
    fn subgroup_width_selection(){
        let device = Device::software().unwrap();
        let commands = device.begin_commands();
        assert_eq!(commands.select_subgroup_size(&[ 64, 16 ]).unwrap(), 64);

        let mut caps = DeviceCaps::software();
        caps.min_subgroup_size = 32;
        caps.max_subgroup_size = 32;
        let device = Device::with_caps(caps).unwrap();
        let commands = device.begin_commands();
        assert_eq!(commands.select_subgroup_size(&[ 64, 16, 32 ]).unwrap(), 32);
        assert!(commands.select_subgroup_size(&[ 64, 16 ]).is_err());
    }
}
