// ai
//! 🧪 The process-wide default high-water mark. Lives in its own test binary so nothing
//! else in the suite sees the defaults move under its feet.

use sluice::backends::InMemorySink;
use sluice::{
    Readable, StreamOptions, StreamResult, Writable, default_high_water_mark, set_default_high_water_mark,
};

#[tokio::test]
async fn the_one_where_the_default_moves_for_newcomers_only() -> StreamResult<()> {
    assert_eq!(default_high_water_mark(false), 16 * 1024);
    assert_eq!(default_high_water_mark(true), 16);

    let veteran = Writable::new(InMemorySink::new(), StreamOptions::default())?;
    set_default_high_water_mark(false, 4);
    set_default_high_water_mark(true, 1);

    let newcomer = Writable::new(InMemorySink::new(), StreamOptions::default())?;
    assert_eq!(newcomer.writable_high_water_mark(), 4);
    assert_eq!(veteran.writable_high_water_mark(), 16 * 1024);
    assert!(newcomer.write("abc")?);
    assert!(!newcomer.write("d")?);

    let readable = Readable::new(StreamOptions::object_mode())?;
    assert_eq!(readable.readable_high_water_mark(), 1);

    // -- an explicit value still beats whatever the default is today
    let explicit = Writable::new(InMemorySink::new(), StreamOptions::default().with_high_water_mark(100))?;
    assert_eq!(explicit.writable_high_water_mark(), 100);
    Ok(())
}
