/// Build a [`Fields`](crate::Fields) map: `fields! { "name" => "Bacon", "amount" => 9.99 }`.
#[macro_export]
macro_rules! fields {
    () => {
        $crate::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::Fields::new();
        $(
            fields.insert(::std::string::String::from($key), $crate::Value::from($value));
        )+
        fields
    }};
}

/// Conjunction of `field__lookup` conditions: `q! { "currency" => "usd", "amount__gt" => 10.0 }`.
#[macro_export]
macro_rules! q {
    () => {
        $crate::Q::All
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut q = $crate::Q::All;
        $(
            q = q & $crate::Q::new($key, $value);
        )+
        q
    }};
}

#[cfg(test)]
mod tests {
    use crate::{Fields, Q, Value};

    #[test]
    fn test_fields_macro() {
        let fields: Fields = fields! { "name" => "Bacon", "amount" => 9.99 };
        assert_eq!(fields.get("name"), Some(&Value::from("Bacon")));
        assert_eq!(fields.len(), 2);
        assert!(fields!().is_empty());
    }

    #[test]
    fn test_q_macro() {
        assert_eq!(q! { "name" => "Bacon" }, Q::new("name", "Bacon"));
        assert!(matches!(q! { "a" => 1, "b__gt" => 2 }, Q::And(parts) if parts.len() == 2));
        assert!(q!().is_all());
    }
}
