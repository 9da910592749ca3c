use core::fmt;
use core::ops::BitOr;
use core::time::Duration;

/// Driver-declared port capabilities.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PortAttributes(u32);

impl PortAttributes {
    /// No capabilities: single device, never blocks.
    pub const NONE: Self = Self(0);
    /// The port owns addressable devices `0..max_addr`.
    pub const MULTI_DEVICE: Self = Self(0b001);
    /// I/O may block; requests run on the port's worker thread.
    pub const CAN_BLOCK: Self = Self(0b010);
    /// Explicit locks on an address `>= 0` only block that address.
    pub const PER_DEVICE_LOCK: Self = Self(0b100);

    /// Checks whether every bit of `other` is set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Gets the raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for PortAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PortAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = f.debug_set();
        if self.contains(Self::MULTI_DEVICE) {
            names.entry(&"MULTI_DEVICE");
        }
        if self.contains(Self::CAN_BLOCK) {
            names.entry(&"CAN_BLOCK");
        }
        if self.contains(Self::PER_DEVICE_LOCK) {
            names.entry(&"PER_DEVICE_LOCK");
        }
        names.finish()
    }
}

/// Port creation parameters passed to
/// [`register_port`](crate::AsynManager::register_port).
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Capability bits.
    pub attributes: PortAttributes,
    /// Reconnect automatically whenever the port or a device disconnects.
    pub auto_connect: bool,
    /// Worker thread priority hint (0-99, EPICS scale). Reported only.
    pub priority: u32,
    /// Worker thread stack size; `None` uses the platform default.
    pub stack_size: Option<usize>,
    /// Number of addresses on a multi-device port.
    pub max_addr: i32,
}

impl PortConfig {
    /// Worker priority used when none is given (`epicsThreadPriorityMedium`).
    pub const DEFAULT_PRIORITY: u32 = 50;

    /// Creates a configuration with the given capability bits.
    pub fn new(attributes: PortAttributes) -> Self {
        Self {
            attributes,
            auto_connect: true,
            priority: Self::DEFAULT_PRIORITY,
            stack_size: None,
            max_addr: if attributes.contains(PortAttributes::MULTI_DEVICE) {
                i32::MAX
            } else {
                1
            },
        }
    }

    /// Sets the autoconnect policy.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Sets the worker thread priority hint.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the worker thread stack size.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Sets the address range of a multi-device port.
    pub fn with_max_addr(mut self, max_addr: i32) -> Self {
        self.max_addr = max_addr;
        self
    }

    /// Whether the port owns several devices.
    #[inline]
    pub fn is_multi_device(&self) -> bool {
        self.attributes.contains(PortAttributes::MULTI_DEVICE)
    }

    /// Whether requests run on a worker thread.
    #[inline]
    pub fn can_block(&self) -> bool {
        self.attributes.contains(PortAttributes::CAN_BLOCK)
    }

    /// Whether explicit locks can be taken per address.
    #[inline]
    pub fn per_device_lock(&self) -> bool {
        self.is_multi_device() && self.attributes.contains(PortAttributes::PER_DEVICE_LOCK)
    }
}

/// Manager-wide settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Delay between failed autoconnect attempts.
    pub reconnect_interval: Duration,
    /// Timeout given to newly created users.
    pub default_timeout: Duration,
}

impl ManagerConfig {
    /// Sets the delay between failed autoconnect attempts.
    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets the timeout given to newly created users.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(20),
            default_timeout: Duration::from_secs(1),
        }
    }
}
