//! End-to-end dispatch tests. They need a GPU adapter:
//! `cargo test -- --ignored`.

use std::collections::{BTreeMap, BTreeSet};

use glc::{range, Bind, Buffer, Flag, Format, Gpu, Lifetime, Record, Rename, Representation, Value, FLOAT, INT, VEC2};

fn gpu() -> Gpu {
    Gpu::new().unwrap()
}

fn ints(gpu: &Gpu, values: &[i32]) -> Buffer {
    Buffer::from_slice(gpu, INT, values).unwrap()
}

async fn read_ints(buffer: &Buffer) -> Vec<i32> {
    buffer.read_slice::<i32>().await.unwrap()
}

fn shuffled(n: usize) -> Vec<i32> {
    let mut values: Vec<i32> = (0..n as i32).collect();
    for i in (1..n).rev() {
        let j = glc::random::next_u32() as usize % (i + 1);
        values.swap(i, j);
    }
    values
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_round_trip_representations() {
    let gpu = gpu();
    let buffer = ints(&gpu, &[5, 6, 7]);
    buffer.acquire(Representation::Texture).await.unwrap();
    buffer.discard(Representation::Host);
    buffer.discard(Representation::Device);
    assert_eq!(buffer.representations(), vec![Representation::Texture]);
    assert_eq!(read_ints(&buffer).await, vec![5, 6, 7]);

    let again = ints(&gpu, &[5, 6, 7]);
    again.acquire(Representation::Device).await.unwrap();
    again.discard(Representation::Host);
    assert_eq!(read_ints(&again).await, vec![5, 6, 7]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_map_doubles() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(FLOAT.into(), FLOAT.into(), Format::Null, "fn map(i: i32) { write(read(i) * 2.0); }")
        .unwrap();
    for n in [8usize, 37] {
        let input: Vec<f32> = (1..=n).map(|v| v as f32).collect();
        let buffer = Buffer::from_slice(&gpu, FLOAT, &input).unwrap();
        let out = range(n).map(&gpu, &kernel, Bind::read(&buffer)).await.unwrap();
        let expected: Vec<f32> = input.iter().map(|v| v * 2.0).collect();
        assert_eq!(out.read_slice::<f32>().await.unwrap(), expected);
    }
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_reduce_sum_and_product() {
    let gpu = gpu();
    let sum = gpu
        .kernel(
            INT.into(),
            INT.into(),
            Format::Null,
            "fn reduce(i: i32) { write(read(i) + read(i + 1) + read(i + 2) + read(i + 3)); }",
        )
        .unwrap();
    let product = gpu
        .kernel(
            INT.into(),
            INT.into(),
            Format::Null,
            "const identity = 1;\nfn reduce(i: i32) { write(read(i) * read(i + 1) * read(i + 2) * read(i + 3)); }",
        )
        .unwrap();

    let values = ints(&gpu, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let total = range(8).reduce(&gpu, &sum, Bind::read(&values)).await.unwrap();
    assert_eq!(read_ints(&total).await, vec![36]);

    let values = ints(&gpu, &[1, 2, 3, 4]);
    let total = range(4).reduce(&gpu, &product, Bind::read(&values)).await.unwrap();
    assert_eq!(read_ints(&total).await, vec![24]);

    let long: Vec<i32> = (1..=37).collect();
    let values = ints(&gpu, &long);
    let total = range(37).reduce(&gpu, &sum, Bind::read(&values)).await.unwrap();
    assert_eq!(read_ints(&total).await, vec![703]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_scan_batch_sizes() {
    let gpu = gpu();
    let sources = [
        "fn scan(i: i32) { write(read(i) + read(i + 1)); }",
        "fn scan(i: i32) {
            let v = read(i, f_vec4i);
            write(v.x + v.y, v.z + v.w);
        }",
        "fn scan(i: i32) {
            let a = read(i, f_vec4i);
            let b = read(i + 4, f_vec4i);
            write(a.x + a.y, a.z + a.w, b.x + b.y, b.z + b.w);
        }",
    ];
    let expected = [1, 3, 6, 10, 15, 21, 28, 36];
    for source in sources {
        let kernel = gpu.kernel(INT.into(), INT.into(), Format::Null, source).unwrap();
        for n in 5..=8usize {
            let input: Vec<i32> = (1..=n as i32).collect();
            let buffer = ints(&gpu, &input);
            let out = range(n).scan(&gpu, &kernel, Bind::read(&buffer)).await.unwrap();
            assert_eq!(read_ints(&out).await, expected[..n].to_vec(), "{source} over {n}");
            // the input survives the scan
            assert_eq!(read_ints(&buffer).await, input);
        }
    }
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_scan_degenerate_lengths() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn scan(i: i32) { write(read(i) + read(i + 1)); }")
        .unwrap();
    let buffer = ints(&gpu, &[4, 9]);
    let one = range(1).scan(&gpu, &kernel, Bind::read(&buffer)).await.unwrap();
    assert_eq!(read_ints(&one).await, vec![4]);
    let two = range(2).scan(&gpu, &kernel, Bind::read(&buffer)).await.unwrap();
    assert_eq!(read_ints(&two).await, vec![4, 13]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_scan_running_max() {
    let gpu = gpu();
    // running maximum over a shuffled range
    let kernel = gpu
        .kernel(
            INT.into(),
            INT.into(),
            Format::Null,
            "const identity = -1000;\nfn scan(i: i32, swapped: i32) { write(max(read(i), read(i + 1))); }",
        )
        .unwrap();
    let input = shuffled(100);
    let buffer = ints(&gpu, &input);
    let out = range(100).scan(&gpu, &kernel, Bind::read(&buffer)).await.unwrap();
    let mut best = -1000;
    let expected: Vec<i32> = input
        .iter()
        .map(|&v| {
            best = best.max(v);
            best
        })
        .collect();
    assert_eq!(read_ints(&out).await, expected);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_filtro_keeps_odd() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn filtro(i: i32) { write(read(i) % 2); }")
        .unwrap();
    let values = ints(&gpu, &[0, 1, 2, 3, 4, 5, 6, 7]);
    let out = range(8)
        .filtro_with(&gpu, &kernel, Bind::read(&values), &[Flag::Length])
        .await
        .unwrap();
    assert_eq!(read_ints(&out.result).await, vec![1, 3, 5, 7, -1, -1, -1, -1]);
    assert_eq!(read_ints(out.length.as_ref().unwrap()).await, vec![4]);

    let plain = range(8).filtro(&gpu, &kernel, Bind::read(&values)).await.unwrap();
    assert_eq!(read_ints(&plain).await.len(), 8);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_sort_permutations() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn sort(a: i32, b: i32) { write(read(a) - read(b)); }")
        .unwrap();
    for n in [1usize, 7, 16, 100, 128, 150] {
        for _ in 0..3 {
            let input = shuffled(n);
            let buffer = ints(&gpu, &input);
            let order = range(n).sort(&gpu, &kernel, Bind::read(&buffer)).await.unwrap();
            let order = read_ints(&order).await;
            let sorted: Vec<i32> = order.iter().map(|&k| input[k as usize]).collect();
            assert_eq!(sorted, (0..n as i32).collect::<Vec<_>>(), "n = {n}");
        }
    }
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_sort_ties_stay_a_permutation() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn sort(a: i32, b: i32) { write(read(a) - read(b)); }")
        .unwrap();
    let input = [3, 1, 3, 0, 1, 3, 0];
    let buffer = ints(&gpu, &input);
    let order = read_ints(&range(7).sort(&gpu, &kernel, Bind::read(&buffer)).await.unwrap()).await;
    let seen: BTreeSet<i32> = order.iter().copied().collect();
    assert_eq!(seen, (0..7).collect());
    let sorted: Vec<i32> = order.iter().map(|&k| input[k as usize]).collect();
    assert_eq!(sorted, vec![0, 0, 1, 1, 3, 3, 3]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_group_places_every_element() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn group(i: i32) { write(read(i)); }")
        .unwrap();
    let ids = ints(&gpu, &(0..12).collect::<Vec<_>>());
    let out = range(12)
        .with_group_size(40)
        .group_with(&gpu, &kernel, Bind::read(&ids), &[Flag::Length, Flag::Start, Flag::Overflow])
        .await
        .unwrap();

    let table = read_ints(&out.result).await;
    assert_eq!(table.len(), 44);
    let placed: Vec<i32> = table.iter().copied().filter(|&s| s >= 0).collect();
    assert_eq!(placed.iter().copied().collect::<BTreeSet<_>>(), (0..12).collect());
    assert_eq!(placed.len(), 12);

    assert_eq!(read_ints(out.length.as_ref().unwrap()).await, vec![12]);
    assert_eq!(read_ints(out.overflow.as_ref().unwrap()).await, vec![0]);
    let start = read_ints(out.start.as_ref().unwrap()).await;
    for (i, &base) in start.iter().enumerate() {
        assert!(base >= 0 && base % 4 == 0);
        let bucket = &table[base as usize..base as usize + 4];
        assert!(bucket.contains(&(i as i32)));
    }
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_group_overflow_counts_unplaced() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn group(i: i32) { write(read(i)); }")
        .unwrap();
    // seven elements share one id, one is left out
    let ids = ints(&gpu, &[5, 5, 5, 5, 5, 5, 5, -1]);
    let out = range(8)
        .with_group_size(1)
        .group_with(&gpu, &kernel, Bind::read(&ids), &[Flag::Length, Flag::Overflow])
        .await
        .unwrap();
    assert_eq!(read_ints(out.length.as_ref().unwrap()).await, vec![4]);
    assert_eq!(read_ints(out.overflow.as_ref().unwrap()).await, vec![3]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_group_colliding_ids_share_a_bucket() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn group(i: i32) { write(read(i)); }")
        .unwrap();
    // group size 8 hashes into two buckets: the even ids collide whatever the offset
    let ids = ints(&gpu, &[0, 2, 0, 2, 4, 1]);
    let out = range(6)
        .with_group_size(8)
        .group_with(&gpu, &kernel, Bind::read(&ids), &[Flag::Length, Flag::Start, Flag::Overflow])
        .await
        .unwrap();

    let table = read_ints(&out.result).await;
    assert_eq!(table.len(), 8);
    let start = read_ints(out.start.as_ref().unwrap()).await;
    let even = start[0];
    assert!(even >= 0 && even % 4 == 0);
    assert_eq!(&start[..4], &[even; 4]);
    assert_eq!(&table[even as usize..even as usize + 4], &[0, 1, 2, 3]);
    // the fifth even element found no free slot
    assert_eq!(start[4], -1);
    let odd = start[5];
    assert!(odd >= 0 && odd != even);
    assert_eq!(&table[odd as usize..odd as usize + 4], &[5, -1, -1, -1]);

    assert_eq!(read_ints(out.length.as_ref().unwrap()).await, vec![5]);
    assert_eq!(read_ints(out.overflow.as_ref().unwrap()).await, vec![1]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_identity_pads_batched_reads() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(
            INT.into(),
            INT.into(),
            Format::Null,
            "const identity = 99;\nfn map(i: i32) {\n    let v = read(i, f_vec4i);\n    write(v.x, v.y, v.z, v.w);\n}",
        )
        .unwrap();
    let values = ints(&gpu, &[0, 1, 2, 3, 4, 5, 6]);
    let out = range(10).map(&gpu, &kernel, Bind::read(&values)).await.unwrap();
    assert_eq!(read_ints(&out).await, vec![0, 1, 2, 3, 4, 5, 6, 99, 99, 99]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_scope_is_a_parameter() {
    let gpu = gpu();
    let scope = Format::complex([("offset", INT)]);
    let kernel = gpu
        .kernel(INT.into(), INT.into(), scope.clone(), "fn map(i: i32) { write(read(i) + read_offset()); }")
        .unwrap();
    let values = ints(&gpu, &[10, 20, 30, 40, 50]);
    let offset = |v: i32| -> Buffer {
        let record = BTreeMap::from([("offset".to_string(), Value::Int(vec![v]))]);
        Buffer::from_records(&gpu, scope.clone(), &record).unwrap()
    };
    let (one, two) = (offset(1), offset(2));
    let a = range(5).map(&gpu, &kernel, Bind::read(&values).scope(&one)).await.unwrap();
    let b = range(5).map(&gpu, &kernel, Bind::read(&values).scope(&two)).await.unwrap();
    let (a, b) = (read_ints(&a).await, read_ints(&b).await);
    assert_eq!(a, vec![11, 21, 31, 41, 51]);
    assert!(a.iter().zip(&b).all(|(x, y)| y - x == 1));
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_random_values_distinct() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(Format::Null, FLOAT.into(), Format::Null, "fn map(i: i32) { write(random()); }")
        .unwrap();
    let out = range(500).map(&gpu, &kernel, Bind::default()).await.unwrap();
    let values = out.read_slice::<f32>().await.unwrap();
    assert_eq!(values.len(), 500);
    assert!(values.iter().all(|v| (0.0..1.0).contains(v)));
    let distinct: BTreeSet<u32> = values.iter().map(|v| v.to_bits()).collect();
    assert_eq!(distinct.len(), 500);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_consumed_read_is_freed() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn map(i: i32) { write(read(i) + 1); }")
        .unwrap();
    let values = ints(&gpu, &[1, 2, 3]);
    let out = range(3).map(&gpu, &kernel, Bind::read(values.consume())).await.unwrap();
    assert_eq!(read_ints(&out).await, vec![2, 3, 4]);
    assert!(values.representations().is_empty());
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_copy_and_concat() {
    let gpu = gpu();
    let a = ints(&gpu, &[1, 2, 3]);
    let b = ints(&gpu, &[4, 5, 6, 7, 8]);
    let copy = a.copy().await.unwrap();
    assert_eq!(read_ints(&copy).await, vec![1, 2, 3]);

    let joined = Buffer::concat(&[&a, &b]).await.unwrap();
    assert_eq!(read_ints(&joined).await, vec![1, 2, 3, 4, 5, 6, 7, 8]);

    let stolen = b.consume().copy().await.unwrap();
    assert!(b.representations().is_empty());
    assert_eq!(read_ints(&stolen).await, vec![4, 5, 6, 7, 8]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_complex_concat_and_split() {
    let gpu = gpu();
    let format = Format::complex([("id", INT), ("pos", VEC2)]);
    let record = |ids: Vec<i32>, pos: Vec<f32>| -> Record {
        BTreeMap::from([("id".to_string(), Value::Int(ids)), ("pos".to_string(), Value::Float(pos))])
    };
    let a = Buffer::from_records(&gpu, format.clone(), &record(vec![1, 2], vec![0.5, 1.5, 2.5, 3.5])).unwrap();
    let b = Buffer::from_records(&gpu, format.clone(), &record(vec![3], vec![4.5, 5.5])).unwrap();

    let joined = Buffer::concat(&[&a, &b]).await.unwrap();
    assert_eq!(joined.length(), Some(3));
    let columns = joined.read_records().await.unwrap();
    assert_eq!(columns["id"], Value::Int(vec![1, 2, 3]));
    assert_eq!(columns["pos"], Value::Float(vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5]));

    let parts = joined.split().await.unwrap();
    assert_eq!(parts["id"].format(), &Format::Simple(INT));
    assert_eq!(read_ints(&parts["id"]).await, vec![1, 2, 3]);
    assert_eq!(parts["pos"].read_slice::<f32>().await.unwrap(), vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_concat_rejects_unequal_attributes() {
    let gpu = gpu();
    let format = Format::complex([("a", INT), ("b", INT)]);
    let record = BTreeMap::from([("a".to_string(), Value::Int(vec![1, 2])), ("b".to_string(), Value::Int(vec![1]))]);
    let uneven = Buffer::from_records(&gpu, format, &record).unwrap();
    let err = Buffer::concat(&[&uneven]).await.unwrap_err();
    assert!(matches!(err, glc::Error::UnequalLengths { index: 0, .. }));
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_merge_and_rename() {
    let gpu = gpu();
    let ids = ints(&gpu, &[7, 8, 9]);
    let weights = Buffer::from_slice(&gpu, FLOAT, &[0.25f32, 0.5, 0.75]).unwrap();
    let merged = Buffer::merge(&[(Some("id"), &ids), (Some("w"), &weights)]).unwrap();
    let columns = merged.read_records().await.unwrap();
    assert_eq!(columns["id"], Value::Int(vec![7, 8, 9]));
    assert_eq!(columns["w"], Value::Float(vec![0.25, 0.5, 0.75]));

    let renamed = merged
        .rename(Rename::Keys(BTreeMap::from([("id".to_string(), "key".to_string())])))
        .await
        .unwrap();
    assert_eq!(renamed.format(), &Format::complex([("key", INT)]));
    assert_eq!(renamed.read_records().await.unwrap()["key"], Value::Int(vec![7, 8, 9]));

    let unwrapped = merged.rename(Rename::Unwrap("w".to_string())).await.unwrap();
    assert_eq!(unwrapped.read_slice::<f32>().await.unwrap(), vec![0.25, 0.5, 0.75]);

    let wrapped = ids.rename(Rename::Wrap("n".to_string())).await.unwrap();
    assert_eq!(wrapped.format(), &Format::complex([("n", INT)]));
    assert!(ids.rename(Rename::Unwrap("n".to_string())).await.is_err());
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_slice() {
    let gpu = gpu();
    let values = ints(&gpu, &(0..10).collect::<Vec<_>>());
    let aligned = values.slice(4, None).await.unwrap();
    assert_eq!(read_ints(&aligned).await, vec![4, 5, 6, 7, 8, 9]);
    let unaligned = values.slice(3, Some(-2)).await.unwrap();
    assert_eq!(read_ints(&unaligned).await, vec![3, 4, 5, 6, 7]);
    let clamped = values.slice(8, Some(100)).await.unwrap();
    assert_eq!(read_ints(&clamped).await, vec![8, 9]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_lifetime_frees_unkept() {
    let gpu = gpu();
    let kept;
    let dropped = ints(&gpu, &[1]);
    let witness = ints(&gpu, &[2]);
    {
        let mut lifetime = Lifetime::new();
        let a = lifetime.adopt(dropped.copy().await.unwrap());
        let b = lifetime.adopt(witness.copy().await.unwrap());
        assert_eq!(lifetime.len(), 2);
        assert!(lifetime.get(a).is_some());
        kept = lifetime.keep(b).unwrap();
        assert!(lifetime.get(b).is_none());
        assert!(lifetime.keep(b).is_none());
    }
    assert_eq!(read_ints(&kept).await, vec![2]);
}

#[tokio::test]
#[ignore = "requires GPU"]
async fn test_wrong_method_is_rejected() {
    let gpu = gpu();
    let kernel = gpu
        .kernel(INT.into(), INT.into(), Format::Null, "fn map(i: i32) { write(read(i)); }")
        .unwrap();
    let values = ints(&gpu, &[1, 2]);
    let err = range(2).reduce(&gpu, &kernel, Bind::read(&values)).await.unwrap_err();
    assert!(matches!(err, glc::Error::MethodMismatch { .. }));
    let err = glc::Range::new(1, 2)
        .map(&gpu, &kernel, Bind::read(&values))
        .await
        .unwrap_err();
    assert!(matches!(err, glc::Error::UnsupportedRange { start: 1, end: 2 }));
}
