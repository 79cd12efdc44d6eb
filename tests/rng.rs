use covfuzz::Rng;

#[test]
fn indices_stay_in_range() -> anyhow::Result<()> {
    let mut rng = Rng::new(7);
    assert_eq!(rng.gen_index(0), None);
    assert_eq!(rng.below(0), 0);

    let mut seen = [false; 5];
    for _ in 0..1000 {
        let i = rng.gen_index(5).unwrap();
        seen[i] = true;
        assert!(rng.below(3) < 3);
    }
    assert!(seen.iter().all(|s| *s));

    assert_eq!(rng.choose::<u8>(&[]), None);
    assert_eq!(rng.choose(&[9]), Some(&9));
    Ok(())
}

#[test]
fn same_seed_same_stream() -> anyhow::Result<()> {
    let mut a = Rng::new(42);
    let mut b = Rng::new(42);
    for _ in 0..100 {
        assert_eq!(a.gen_index(1 << 20), b.gen_index(1 << 20));
    }
    assert_eq!(a.fork().gen_u64(), b.fork().gen_u64());
    Ok(())
}
