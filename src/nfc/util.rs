pub trait IntoRaw<T: Clone> {
    fn into_raw(self) -> T;
}

/// A value that is either a recognized enum variant or the raw wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownOrRaw<TU: Clone, TK: IntoRaw<TU>> {
    Known(TK),
    Unknown(TU),
}

impl<TU: Clone, TK: IntoRaw<TU>> IntoRaw<TU> for KnownOrRaw<TU, TK> {
    fn into_raw(self) -> TU {
        match self {
            KnownOrRaw::Known(known) => known.into_raw(),
            KnownOrRaw::Unknown(raw) => raw,
        }
    }
}

impl<TU: Clone, TK: IntoRaw<TU> + TryFrom<TU>> From<TU> for KnownOrRaw<TU, TK> {
    fn from(raw: TU) -> Self {
        match TK::try_from(raw.clone()) {
            Ok(known) => KnownOrRaw::Known(known),
            Err(_) => KnownOrRaw::Unknown(raw),
        }
    }
}

/// Implement [IntoRaw] and `TryFrom<raw>` for an enum represented by a raw
/// value. The enum must derive [`strum_macros::EnumIter`].
macro_rules! impl_partial_enum {
    ($enum_name:ty, $backing:ty) => {
        use crate::nfc::util;
        impl util::IntoRaw<$backing> for $enum_name {
            fn into_raw(self) -> $backing {
                self as $backing
            }
        }
        impl TryFrom<$backing> for $enum_name {
            type Error = ();
            fn try_from(raw: $backing) -> Result<Self, Self::Error> {
                use ::strum::IntoEnumIterator;
                match Self::iter().find(|&v| util::IntoRaw::into_raw(v) == raw) {
                    Some(v) => Ok(v),
                    None => Err(()),
                }
            }
        }
    };
}

pub(crate) use impl_partial_enum;
