#[macro_export]
macro_rules! t {
    ($amount:literal millis) => {{
        $crate::core::time::Duration::millis($amount)
    }};
    ($amount:literal seconds) => {{
        $crate::core::time::Duration::seconds($amount)
    }};
    ($amount:literal minutes) => {{
        $crate::core::time::Duration::minutes($amount)
    }};
    ($amount:literal hours) => {{
        $crate::core::time::Duration::hours($amount)
    }};

    ($time:ident + $amount:literal $unit:ident) => {{
        $time + $crate::t!($amount $unit)
    }};
    ($time:ident - $amount:literal $unit:ident) => {{
        $time - $crate::t!($amount $unit)
    }};
}
