//! Header flag byte and small header enums

/// Block flags (1 byte): reserved(1) executable(1) end_of_scope(1) device_type(5)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockFlags(pub u8);

impl BlockFlags {
    pub const NONE: BlockFlags = BlockFlags(0);

    pub const RESERVED: u8 = 0b1000_0000;
    pub const EXECUTABLE: u8 = 0b0100_0000;
    pub const END_OF_SCOPE: u8 = 0b0010_0000;
    pub const DEVICE_TYPE_MASK: u8 = 0b0001_1111;

    #[inline]
    pub fn new(bits: u8) -> Self {
        BlockFlags(bits)
    }

    #[inline]
    pub fn is_executable(self) -> bool {
        self.0 & Self::EXECUTABLE != 0
    }

    #[inline]
    pub fn is_end_of_scope(self) -> bool {
        self.0 & Self::END_OF_SCOPE != 0
    }

    #[inline]
    pub fn device_type(self) -> u8 {
        self.0 & Self::DEVICE_TYPE_MASK
    }

    #[inline]
    pub fn set_executable(&mut self, value: bool) {
        if value {
            self.0 |= Self::EXECUTABLE;
        } else {
            self.0 &= !Self::EXECUTABLE;
        }
    }

    #[inline]
    pub fn set_end_of_scope(&mut self, value: bool) {
        if value {
            self.0 |= Self::END_OF_SCOPE;
        } else {
            self.0 &= !Self::END_OF_SCOPE;
        }
    }

    #[inline]
    pub fn set_device_type(&mut self, device: u8) {
        self.0 = (self.0 & !Self::DEVICE_TYPE_MASK) | (device & Self::DEVICE_TYPE_MASK);
    }
}

/// Message kind byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageKind {
    /// Executed by the receiver, answered with a RESPONSE
    #[default]
    Request = 0,
    Response = 1,
    Data = 2,
    /// Externally anchored transaction
    Anchor = 3,
    /// Executed without sending a response
    Local = 4,
    /// Endpoint announcement carrying its verifying key
    Hello = 6,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Data),
            3 => Some(MessageKind::Anchor),
            4 => Some(MessageKind::Local),
            6 => Some(MessageKind::Hello),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether the block answers an earlier request
    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Data | MessageKind::Local)
    }
}

/// Signed/encrypted tri-state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SecurityMode {
    #[default]
    None = 0,
    Signed = 1,
    SignedEncrypted = 2,
    Encrypted = 3,
}

impl SecurityMode {
    pub fn new(signed: bool, encrypted: bool) -> Self {
        match (signed, encrypted) {
            (false, false) => SecurityMode::None,
            (true, false) => SecurityMode::Signed,
            (true, true) => SecurityMode::SignedEncrypted,
            (false, true) => SecurityMode::Encrypted,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SecurityMode::None),
            1 => Some(SecurityMode::Signed),
            2 => Some(SecurityMode::SignedEncrypted),
            3 => Some(SecurityMode::Encrypted),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_signed(self) -> bool {
        matches!(self, SecurityMode::Signed | SecurityMode::SignedEncrypted)
    }

    #[inline]
    pub fn is_encrypted(self) -> bool {
        matches!(self, SecurityMode::SignedEncrypted | SecurityMode::Encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_bits() {
        let mut flags = BlockFlags::NONE;
        flags.set_executable(true);
        flags.set_end_of_scope(true);
        flags.set_device_type(0x3f);
        assert_eq!(flags.0, 0b0111_1111);
        assert_eq!(flags.device_type(), 0x1f);

        flags.set_executable(false);
        assert!(!flags.is_executable());
        assert!(flags.is_end_of_scope());
    }

    #[test]
    fn test_message_kind_bytes() {
        assert_eq!(MessageKind::from_byte(6), Some(MessageKind::Hello));
        assert_eq!(MessageKind::from_byte(5), None);
        assert!(MessageKind::Response.is_reply());
        assert!(!MessageKind::Request.is_reply());
    }

    #[test]
    fn test_security_mode() {
        let mode = SecurityMode::new(true, true);
        assert_eq!(mode.to_byte(), 2);
        assert!(mode.is_signed() && mode.is_encrypted());
        assert!(!SecurityMode::Encrypted.is_signed());
    }
}
