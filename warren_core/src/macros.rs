#[macro_export]
macro_rules! newtype_id {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name(uuid::Uuid);

        impl $name {
            #[must_use]
            pub fn random() -> Self {
                Self(uuid::Uuid::from_bytes(rand::random()))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

#[macro_export]
macro_rules! name_newtype {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        /// A newtype wrapper around `Arc<str>`, which guarantees cheap clones.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        $vis struct $name(std::sync::Arc<str>);

        impl $name {
            pub fn new(inner: impl Into<std::sync::Arc<str>>) -> Self {
                Self(inner.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

/// Rejects a method field combination the broker does not support, with a
/// 540 reply pointing at the offending location.
#[macro_export]
macro_rules! method_unsupported {
    () => {
        return Err($crate::error::ConException::NotImplemented(concat!(
            file!(),
            ":",
            line!()
        ))
        .into())
    };
}
