//! ECMA-335 attribute flag words (§II.23.1).
//!
//! Only the bits the compiler acts on are named; the masked sub-fields
//! (visibility, layout, member access) get accessor helpers instead of one
//! flag per value.

use bitflags::bitflags;

bitflags! {
    /// TypeDef flags (§II.23.1.15).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeAttributes: u32 {
        const INTERFACE = 0x0000_0020;
        const ABSTRACT = 0x0000_0080;
        const SEALED = 0x0000_0100;
        const SPECIAL_NAME = 0x0000_0400;
        const IMPORT = 0x0000_1000;
        const SERIALIZABLE = 0x0000_2000;
        const BEFORE_FIELD_INIT = 0x0010_0000;
        const RT_SPECIAL_NAME = 0x0000_0800;
        const _ = !0;
    }
}

impl TypeAttributes {
    const VISIBILITY_MASK: u32 = 0x0000_0007;
    const LAYOUT_MASK: u32 = 0x0000_0018;

    pub fn is_public(&self) -> bool {
        matches!(self.bits() & Self::VISIBILITY_MASK, 0x1 | 0x2)
    }

    pub fn layout(&self) -> TypeLayout {
        match self.bits() & Self::LAYOUT_MASK {
            0x00 => TypeLayout::Auto,
            0x08 => TypeLayout::Sequential,
            0x10 => TypeLayout::Explicit,
            _ => TypeLayout::Auto,
        }
    }
}

/// The class-layout sub-field of [`TypeAttributes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeLayout {
    Auto,
    Sequential,
    Explicit,
}

bitflags! {
    /// Field flags (§II.23.1.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u16 {
        const STATIC = 0x0010;
        const INIT_ONLY = 0x0020;
        const LITERAL = 0x0040;
        const NOT_SERIALIZED = 0x0080;
        const SPECIAL_NAME = 0x0200;
        const PINVOKE_IMPL = 0x2000;
        const RT_SPECIAL_NAME = 0x0400;
        const HAS_FIELD_MARSHAL = 0x1000;
        const HAS_DEFAULT = 0x8000;
        const HAS_FIELD_RVA = 0x0100;
        const _ = !0;
    }
}

impl FieldAttributes {
    const ACCESS_MASK: u16 = 0x0007;

    pub fn is_public(&self) -> bool {
        self.bits() & Self::ACCESS_MASK == 0x6
    }
}

bitflags! {
    /// Method flags (§II.23.1.10).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAttributes: u16 {
        const STATIC = 0x0010;
        const FINAL = 0x0020;
        const VIRTUAL = 0x0040;
        const HIDE_BY_SIG = 0x0080;
        const NEW_SLOT = 0x0100;
        const STRICT = 0x0200;
        const ABSTRACT = 0x0400;
        const SPECIAL_NAME = 0x0800;
        const PINVOKE_IMPL = 0x2000;
        const RT_SPECIAL_NAME = 0x1000;
        const HAS_SECURITY = 0x4000;
        const REQUIRE_SEC_OBJECT = 0x8000;
        const _ = !0;
    }
}

impl MethodAttributes {
    const ACCESS_MASK: u16 = 0x0007;

    pub fn is_public(&self) -> bool {
        self.bits() & Self::ACCESS_MASK == 0x6
    }
}

bitflags! {
    /// Method implementation flags (§II.23.1.11).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodImplAttributes: u16 {
        const NATIVE = 0x0001;
        const OPTIL = 0x0002;
        const RUNTIME = 0x0003;
        const UNMANAGED = 0x0004;
        const NO_INLINING = 0x0008;
        const FORWARD_REF = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const NO_OPTIMIZATION = 0x0040;
        const PRESERVE_SIG = 0x0080;
        const AGGRESSIVE_INLINING = 0x0100;
        const INTERNAL_CALL = 0x1000;
        const _ = !0;
    }
}

impl MethodImplAttributes {
    const CODE_TYPE_MASK: u16 = 0x0003;

    /// True when the body is IL rather than native or runtime-provided.
    pub fn is_il(&self) -> bool {
        self.bits() & Self::CODE_TYPE_MASK == 0
    }

    pub fn is_runtime(&self) -> bool {
        self.bits() & Self::CODE_TYPE_MASK == Self::RUNTIME.bits()
    }
}

bitflags! {
    /// Param flags (§II.23.1.13).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParamAttributes: u16 {
        const IN = 0x0001;
        const OUT = 0x0002;
        const OPTIONAL = 0x0010;
        const HAS_DEFAULT = 0x1000;
        const HAS_FIELD_MARSHAL = 0x2000;
        const _ = !0;
    }
}

bitflags! {
    /// ImplMap (P/Invoke) flags (§II.23.1.8).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PInvokeAttributes: u16 {
        const NO_MANGLE = 0x0001;
        const SUPPORTS_LAST_ERROR = 0x0040;
        const _ = !0;
    }
}

impl PInvokeAttributes {
    const CHARSET_MASK: u16 = 0x0006;
    const CALLCONV_MASK: u16 = 0x0700;

    pub fn charset(&self) -> u16 {
        self.bits() & Self::CHARSET_MASK
    }

    pub fn calling_convention(&self) -> u16 {
        self.bits() & Self::CALLCONV_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_layout_subfield() {
        let seq = TypeAttributes::from_bits_retain(0x0010_0008);
        assert_eq!(seq.layout(), TypeLayout::Sequential);
        assert!(seq.contains(TypeAttributes::BEFORE_FIELD_INIT));
        let exp = TypeAttributes::from_bits_retain(0x0000_0110);
        assert_eq!(exp.layout(), TypeLayout::Explicit);
        assert!(exp.contains(TypeAttributes::SEALED));
    }

    #[test]
    fn method_code_type() {
        assert!(MethodImplAttributes::from_bits_retain(0x0000).is_il());
        assert!(MethodImplAttributes::from_bits_retain(0x1000).is_il());
        assert!(MethodImplAttributes::from_bits_retain(0x0003).is_runtime());
        assert!(!MethodImplAttributes::from_bits_retain(0x0001).is_il());
    }
}
