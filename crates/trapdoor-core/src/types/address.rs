//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the tracee's virtual address space
///
/// A thin wrapper around `u64` so addresses cannot be confused with sizes,
/// register values or slot indices in the engine's APIs.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::types::Address;
///
/// let addr = Address::from(0x1000_u64);
/// let next_addr = addr + 0x100;
/// assert_eq!(next_addr.value(), 0x1100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// Usable in const contexts:
    ///
    /// ```rust
    /// use trapdoor_core::types::Address;
    ///
    /// const STACK_BASE: Address = Address::new(0x7fff_0000_0000);
    /// ```
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw `u64` value, for handing to the kernel.
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset, returning `None` on overflow
    ///
    /// ```rust
    /// use trapdoor_core::types::Address;
    ///
    /// let addr = Address::from(0x1000_u64);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100_u64)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset, returning `None` on underflow.
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Add an offset, saturating at `u64::MAX`.
    #[must_use]
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }

    /// Round down to a multiple of `granule` (a power of two)
    ///
    /// ```rust
    /// use trapdoor_core::types::Address;
    ///
    /// assert_eq!(Address::new(0x1007).align_down(8), Address::new(0x1000));
    /// ```
    #[must_use]
    pub const fn align_down(self, granule: u64) -> Self
    {
        Address(self.0 & !(granule - 1))
    }

    /// Whether the address is a multiple of `granule`.
    #[must_use]
    pub const fn is_aligned(self, granule: u64) -> bool
    {
        self.0 % granule == 0
    }

    /// Distance between two addresses regardless of order.
    #[must_use]
    pub const fn distance(self, other: Self) -> u64
    {
        self.0.abs_diff(other.0)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<usize> for Address
{
    fn from(value: usize) -> Self
    {
        Address(value as u64)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl Sub<Address> for Address
{
    type Output = u64;

    fn sub(self, rhs: Address) -> Self::Output
    {
        self.0.wrapping_sub(rhs.0)
    }
}
