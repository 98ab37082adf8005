/// Measure this expression
///
/// Use `measure!()` when you have an expression that you want to measure.  `measure!()` will start
/// a new [`Measure`], evaluate your expression, stop the [`Measure`], and then return the
/// [`Measure`] object along with your expression's return value.
///
/// [`Measure`]: crate::measure::Measure
///
/// # Examples
///
/// ```
/// // Measure functions
/// # use sable_measure::measure;
/// # fn foo() {}
/// # fn add(x: i32, y: i32) -> i32 {x + y}
/// let (result, measure) = measure!(foo(), "foo takes no parameters");
/// let (result, measure) = measure!(add(1, 2), "add returns a value");
/// # assert_eq!(result, 1 + 2);
/// ```
///
/// ```
/// // The `name` parameter is optional
/// # use sable_measure::measure;
/// # fn meow() {};
/// let (result, measure) = measure!(meow());
/// ```
#[macro_export]
macro_rules! measure {
    ($val:expr, $name:tt $(,)?) => {{
        let mut measure = $crate::measure::Measure::start($name);
        let result = $val;
        measure.stop();
        (result, measure)
    }};
    ($val:expr) => {
        measure!($val, "")
    };
}

#[cfg(test)]
mod tests {
    fn my_multiply(x: i32, y: i32) -> i32 {
        x * y
    }

    #[test]
    fn test_measure_macro() {
        // Ensure that the measurement side actually works
        {
            let (_result, measure) = measure!(std::thread::sleep(std::time::Duration::from_secs(1)));
            assert!(measure.as_s() >= 0.99f32 && measure.as_s() <= 1.01f32);
        }

        // Ensure that the macro can be called with functions
        {
            let (result, _measure) = measure!(my_multiply(3, 4), "name");
            assert_eq!(result, 3 * 4);
        }

        // Ensure that the macro can be called with blocks
        {
            let (result, _measure) = measure!({ 1 + 2 }, "name");
            assert_eq!(result, 3);
        }

        // Ensure that the macro can be called without a name
        {
            let (result, _measure) = measure!(my_multiply(5, 6));
            assert_eq!(result, 5 * 6);
        }
    }
}
