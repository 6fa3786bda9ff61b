//! SQL values and bound parameters.
//!
//! Values are rusqlite's owned [`Value`]; typed reads go through rusqlite's
//! [`FromSql`](rusqlite::types::FromSql). What this module adds is an owned,
//! `Send` parameter list that can cross into the blocking pool.

pub use rusqlite::types::Value;

/// Conversion of a bound argument into an owned [`Value`].
///
/// Used by [`params!`](crate::params) and [`named_params!`](crate::named_params).
/// Delegates to rusqlite's `From` impls and adds the borrowed forms.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

macro_rules! into_value_via_from {
    ($($t:ty),*) => {
        $(impl IntoValue for $t {
            fn into_value(self) -> Value {
                Value::from(self)
            }
        })*
    };
}

into_value_via_from!(i8, i16, i32, i64, u8, u16, u32, bool, f32, f64, String, Vec<u8>);

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoValue for &String {
    fn into_value(self) -> Value {
        Value::Text(self.clone())
    }
}

impl IntoValue for &[u8] {
    fn into_value(self) -> Value {
        Value::Blob(self.to_vec())
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        self.map(IntoValue::into_value).unwrap_or(Value::Null)
    }
}

/// Parameters bound to a statement.
///
/// Named parameters carry their prefix, e.g. `":id"` or `"@name"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    #[default]
    None,
    Positional(Vec<Value>),
    Named(Vec<(String, Value)>),
}

impl Params {
    pub fn len(&self) -> usize {
        match self {
            Params::None => 0,
            Params::Positional(values) => values.len(),
            Params::Named(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl<const N: usize> From<[Value; N]> for Params {
    fn from(values: [Value; N]) -> Self {
        Params::Positional(values.into())
    }
}

/// Build positional [`Params`].
///
/// ```
/// use ratelimited_db::{params, Params};
///
/// let p = params!["Alice", 42];
/// assert_eq!(p.len(), 2);
/// assert_eq!(params![], Params::None);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::Params::None
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Params::Positional(vec![$($crate::db::IntoValue::into_value($value)),+])
    };
}

/// Build named [`Params`]; names include their prefix.
///
/// ```
/// use ratelimited_db::named_params;
///
/// let p = named_params! { ":name" => "Alice", ":age" => 42 };
/// assert_eq!(p.len(), 2);
/// ```
#[macro_export]
macro_rules! named_params {
    ($($name:expr => $value:expr),* $(,)?) => {
        $crate::Params::Named(vec![$((
            ::std::string::ToString::to_string($name),
            $crate::db::IntoValue::into_value($value),
        )),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_value() {
        assert_eq!(7i32.into_value(), Value::Integer(7));
        assert_eq!(true.into_value(), Value::Integer(1));
        assert_eq!("x".into_value(), Value::Text("x".to_string()));
        assert_eq!(None::<i64>.into_value(), Value::Null);
        assert_eq!(Some(1.5).into_value(), Value::Real(1.5));
        assert_eq!(b"ab".as_slice().into_value(), Value::Blob(vec![b'a', b'b']));
    }

    #[test]
    fn test_params_macros() {
        assert_eq!(crate::params![], Params::None);
        assert_eq!(
            crate::params!["Bob", 2],
            Params::Positional(vec![Value::Text("Bob".into()), Value::Integer(2)])
        );

        let name = String::from("Carol");
        assert_eq!(
            crate::params![&name, None::<String>],
            Params::Positional(vec![Value::Text("Carol".into()), Value::Null])
        );

        let named = crate::named_params! { ":id" => 1 };
        assert_eq!(named, Params::Named(vec![(":id".to_string(), Value::Integer(1))]));
        assert!(Params::from(()).is_empty());
    }
}
