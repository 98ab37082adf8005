//! Structured counter datapoints, reported through the process logger.
//!
//! The external metrics agent is a separate service; this crate only
//! formats datapoints so operators can scrape them from the log stream.

use std::fmt;

pub struct DataPoint {
    pub name: &'static str,
    pub fields: Vec<(&'static str, String)>,
}

impl DataPoint {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: vec![],
        }
    }

    pub fn add_field_str(&mut self, name: &'static str, value: &str) -> &mut Self {
        self.fields
            .push((name, format!("\"{}\"", value.replace('"', "\\\""))));
        self
    }

    pub fn add_field_bool(&mut self, name: &'static str, value: bool) -> &mut Self {
        self.fields.push((name, value.to_string()));
        self
    }

    pub fn add_field_i64(&mut self, name: &'static str, value: i64) -> &mut Self {
        self.fields.push((name, value.to_string() + "i"));
        self
    }

    pub fn add_field_f64(&mut self, name: &'static str, value: f64) -> &mut Self {
        self.fields.push((name, value.to_string()));
        self
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "datapoint: {}", self.name)?;
        for (name, value) in &self.fields {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! create_datapoint {
    (@field $point:ident $name:expr, $string:expr, String) => {
        $point.add_field_str($name, &$string);
    };
    (@field $point:ident $name:expr, $value:expr, i64) => {
        $point.add_field_i64($name, $value as i64);
    };
    (@field $point:ident $name:expr, $value:expr, f64) => {
        $point.add_field_f64($name, $value as f64);
    };
    (@field $point:ident $name:expr, $value:expr, bool) => {
        $point.add_field_bool($name, $value as bool);
    };

    (@fields $point:ident) => {};
    (@fields $point:ident ($name:expr, $value:expr, $type:ident) $(, $rest:tt)*) => {
        $crate::create_datapoint!(@field $point $name, $value, $type);
        $crate::create_datapoint!(@fields $point $($rest),*);
    };

    (@point $name:expr, $($fields:tt)+) => {
        {
            let mut point = $crate::DataPoint::new($name);
            $crate::create_datapoint!(@fields point $($fields)+);
            point
        }
    };
    (@point $name:expr) => {
        $crate::DataPoint::new($name)
    };
}

#[macro_export]
macro_rules! datapoint_info {
    ($name:expr $(, $fields:tt)* $(,)?) => {
        if log::log_enabled!(log::Level::Info) {
            let point = $crate::create_datapoint!(@point $name $(, $fields)*);
            log::info!(target: "metrics", "{point}");
        }
    };
}

#[macro_export]
macro_rules! datapoint_debug {
    ($name:expr $(, $fields:tt)* $(,)?) => {
        if log::log_enabled!(log::Level::Debug) {
            let point = $crate::create_datapoint!(@point $name $(, $fields)*);
            log::debug!(target: "metrics", "{point}");
        }
    };
}

#[macro_export]
macro_rules! datapoint_warn {
    ($name:expr $(, $fields:tt)* $(,)?) => {
        if log::log_enabled!(log::Level::Warn) {
            let point = $crate::create_datapoint!(@point $name $(, $fields)*);
            log::warn!(target: "metrics", "{point}");
        }
    };
}
