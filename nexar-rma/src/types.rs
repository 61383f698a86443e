/// Index of a memory domain within a context's `MdSet`.
pub type MdIndex = u8;

/// Upper bound on memory domains per context (one bit each in `MdMap`).
pub const MAX_MDS: usize = 64;

/// Bitmap of memory domains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MdMap(u64);

impl MdMap {
    pub const EMPTY: MdMap = MdMap(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Map holding only `md`.
    pub const fn single(md: MdIndex) -> Self {
        Self(1u64 << md)
    }

    /// Map holding MDs `0..count`.
    pub const fn first(count: usize) -> Self {
        if count >= MAX_MDS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, md: MdIndex) -> bool {
        (md as usize) < MAX_MDS && self.0 & (1u64 << md) != 0
    }

    /// Indices at or above `MAX_MDS` are ignored.
    pub fn insert(&mut self, md: MdIndex) {
        if (md as usize) < MAX_MDS {
            self.0 |= 1u64 << md;
        }
    }

    pub fn remove(&mut self, md: MdIndex) {
        if (md as usize) < MAX_MDS {
            self.0 &= !(1u64 << md);
        }
    }

    pub const fn union(self, other: MdMap) -> MdMap {
        MdMap(self.0 | other.0)
    }

    pub const fn intersection(self, other: MdMap) -> MdMap {
        MdMap(self.0 & other.0)
    }

    /// Bits in `self` that are not in `other`.
    pub const fn difference(self, other: MdMap) -> MdMap {
        MdMap(self.0 & !other.0)
    }

    pub const fn is_subset(self, other: MdMap) -> bool {
        self.0 & !other.0 == 0
    }

    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Number of set bits strictly below `md`: the dense slot of `md`.
    pub const fn rank(self, md: MdIndex) -> usize {
        let below = if md == 0 {
            0
        } else if md as usize >= MAX_MDS {
            self.0
        } else {
            self.0 & (u64::MAX >> (64 - md as u32))
        };
        below.count_ones() as usize
    }

    /// Set bits in ascending order.
    pub fn iter(self) -> impl Iterator<Item = MdIndex> {
        let mut rest = self.0;
        std::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let md = rest.trailing_zeros() as MdIndex;
            rest &= rest - 1;
            Some(md)
        })
    }
}

impl FromIterator<MdIndex> for MdMap {
    fn from_iter<I: IntoIterator<Item = MdIndex>>(iter: I) -> Self {
        let mut map = MdMap::EMPTY;
        for md in iter {
            map.insert(md);
        }
        map
    }
}

impl std::fmt::Display for MdMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of memory behind an address range.
///
/// The discriminant is the wire value carried in packed remote keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    Host = 0,
    Cuda = 1,
    CudaManaged = 2,
    Rocm = 3,
    RocmManaged = 4,
    Rdma = 5,
    ZeHost = 6,
    ZeDevice = 7,
    ZeManaged = 8,
    Unknown = 9,
}

impl MemoryType {
    pub const ALL: [MemoryType; 10] = [
        MemoryType::Host,
        MemoryType::Cuda,
        MemoryType::CudaManaged,
        MemoryType::Rocm,
        MemoryType::RocmManaged,
        MemoryType::Rdma,
        MemoryType::ZeHost,
        MemoryType::ZeDevice,
        MemoryType::ZeManaged,
        MemoryType::Unknown,
    ];

    pub const fn from_u8(v: u8) -> Option<Self> {
        if (v as usize) < Self::ALL.len() {
            Some(Self::ALL[v as usize])
        } else {
            None
        }
    }

    pub const fn is_host(self) -> bool {
        matches!(self, MemoryType::Host)
    }

    pub const fn is_gpu(self) -> bool {
        matches!(
            self,
            MemoryType::Cuda
                | MemoryType::CudaManaged
                | MemoryType::Rocm
                | MemoryType::ZeDevice
                | MemoryType::ZeManaged
        )
    }

    pub const fn is_accessible_from_cpu(self) -> bool {
        matches!(
            self,
            MemoryType::Host
                | MemoryType::CudaManaged
                | MemoryType::RocmManaged
                | MemoryType::ZeHost
                | MemoryType::ZeManaged
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            MemoryType::Host => "host",
            MemoryType::Cuda => "cuda",
            MemoryType::CudaManaged => "cuda-managed",
            MemoryType::Rocm => "rocm",
            MemoryType::RocmManaged => "rocm-managed",
            MemoryType::Rdma => "rdma",
            MemoryType::ZeHost => "ze-host",
            MemoryType::ZeDevice => "ze-device",
            MemoryType::ZeManaged => "ze-managed",
            MemoryType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of memory types, one bit per `MemoryType` discriminant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemoryTypeSet(u16);

impl MemoryTypeSet {
    pub const EMPTY: MemoryTypeSet = MemoryTypeSet(0);

    pub const fn of(types: &[MemoryType]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < types.len() {
            bits |= 1 << types[i] as u8;
            i += 1;
        }
        Self(bits)
    }

    pub const fn contains(self, mem_type: MemoryType) -> bool {
        self.0 & (1 << mem_type as u8) != 0
    }
}

/// System device a buffer is attached to (e.g. a GPU's PCI slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SysDevice(pub u8);

impl SysDevice {
    pub const UNKNOWN: SysDevice = SysDevice(u8::MAX);
}

impl Default for SysDevice {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// How memory owned by a handle was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocMethod {
    /// Allocated by a memory domain, which also produced its registration key.
    Md(MdIndex),
    /// Allocated from the process heap.
    Heap,
}

/// Datatype override for an RMA request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    /// Contiguous elements of `elem_size` bytes; the request count is in elements.
    Contig { elem_size: usize },
}

impl Datatype {
    /// Byte length of `count` elements, or `None` if it overflows.
    pub const fn length(self, count: usize) -> Option<usize> {
        match self {
            Datatype::Contig { elem_size } => count.checked_mul(elem_size),
        }
    }
}
