use anyhow::Result;
use darray::distributed::run_local_group;
use darray::tensor::{ArrayProto, DistributedArray, LocalArray, Range, Shape};
use darray::DArrayError;

fn ramp(extents: &[usize], scale: f32, offset: f32) -> DistributedArray {
    let shape = Shape::from(extents);
    let data = (0..shape.volume()).map(|v| v as f32 * scale + offset).collect();
    DistributedArray::from_local(LocalArray::from_vec(shape, data))
}

#[test]
fn test_two_rank_partition_bounds() {
    let results = run_local_group(2, |group| {
        let array = DistributedArray::partitioned(Shape::from([4, 4]), 0, &group).unwrap();
        let part = array.partition().unwrap();
        (part.range().clone(), part.local_vol())
    });
    assert_eq!(results[0], (Range::new(vec![0, 0], vec![2, 4]), 8));
    assert_eq!(results[1], (Range::new(vec![2, 0], vec![4, 4]), 8));
}

#[test]
fn test_local_ones_sum() -> Result<()> {
    let mut array = DistributedArray::setup(Shape::from([2, 3]), None);
    array.alloc()?;
    array.set_ones()?;
    assert_eq!(array.sum()?, 6.0);
    Ok(())
}

#[test]
fn test_accumulate_from_two_ranks() {
    let results = run_local_group(2, |group| {
        let mut x = DistributedArray::partitioned(Shape::from([2, 2]), 0, &group).unwrap();
        x.fill(1.0).unwrap();
        let addend = if group.rank() == 0 { 1.5 } else { 2.5 };
        let full = Range::full(x.shape());
        x.accumulate(&full, &[addend; 4], 1.0).unwrap();
        x.sync().unwrap();
        x.fetch_all().unwrap().to_vec()
    });
    for values in results {
        assert_eq!(values, vec![5.0; 4]);
    }
}

#[test]
fn test_double_alloc_partitioned() {
    let results = run_local_group(2, |group| {
        let mut array = DistributedArray::setup(Shape::from([4, 2]), Some(0)).in_group(&group);
        array.alloc().unwrap();
        array.fill(3.0).unwrap();
        let second = array.alloc();
        let intact = array.sum().unwrap();
        (matches!(second, Err(DArrayError::AlreadyAllocated(_))), intact)
    });
    assert!(results.iter().all(|&(failed, sum)| failed && sum == 24.0));
}

#[test]
fn test_proto_reconstructs_partition() {
    let results = run_local_group(2, |group| {
        let array = DistributedArray::partitioned(Shape::from([5, 3]), 0, &group).unwrap();
        let json = array.to_proto().to_json().unwrap();
        let proto = ArrayProto::from_json(&json).unwrap();
        let rebuilt = proto.partition_for(group.size(), group.rank());
        let original = array.partition().unwrap();
        rebuilt == original
            && rebuilt.local_vol() == original.local_vol()
            && rebuilt.total_vol() == original.total_vol()
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_elementwise_laws_partitioned() {
    let results = run_local_group(3, |group| {
        let shape = Shape::from([4, 3]);
        let mut a = DistributedArray::partitioned(shape.clone(), 0, &group).unwrap();
        let mut b = DistributedArray::partitioned(shape.clone(), 0, &group).unwrap();
        let mut c = DistributedArray::partitioned(shape.clone(), 0, &group).unwrap();
        a.copy_from(&ramp(&[4, 3], 1.0, 0.0)).unwrap();
        b.copy_from(&ramp(&[4, 3], -0.5, 2.0)).unwrap();

        c.add(&a, &b).unwrap();
        let mut sums_hold = true;
        for i in 0..4 {
            for j in 0..3 {
                let p = [i, j];
                sums_hold &= c.at(&p).unwrap() == a.at(&p).unwrap() + b.at(&p).unwrap();
            }
        }

        c.minus(&a, &b).unwrap();
        let c_view = c.view();
        c.add(&c_view, &b).unwrap();
        let rebuilt = c.fetch_all().unwrap().to_vec();
        (sums_hold, rebuilt)
    });
    let expected: Vec<f32> = (0..12).map(|v| v as f32).collect();
    for (sums_hold, rebuilt) in results {
        assert!(sums_hold);
        for (x, y) in rebuilt.iter().zip(&expected) {
            assert!((x - y).abs() < 1e-5);
        }
    }
}

#[test]
fn test_operands_with_other_layouts() {
    let results = run_local_group(2, |group| {
        let source = ramp(&[3, 4], 1.0, 0.0);

        // Same volume, different shape, process-local
        let mut dest = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        dest.copy_from(&source).unwrap();

        // Same volume, different shape, split on another axis
        let mut other = DistributedArray::partitioned(Shape::from([3, 4]), 1, &group).unwrap();
        other.copy_from(&source).unwrap();
        let mut dest2 = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        dest2.copy_from(&other).unwrap();

        (dest.fetch_all().unwrap().to_vec(), dest2.fetch_all().unwrap().to_vec())
    });
    let expected: Vec<f32> = (0..12).map(|v| v as f32).collect();
    for (first, second) in results {
        assert_eq!(first, expected);
        assert_eq!(second, expected);
    }
}

#[test]
fn test_aliasing_operand_with_other_shape() {
    let results = run_local_group(2, |group| {
        let mut x = DistributedArray::partitioned(Shape::from([4, 4]), 0, &group).unwrap();
        x.copy_from(&ramp(&[4, 4], 1.0, 0.0)).unwrap();
        let cube = x.reshape(Shape::from([4, 2, 2])).unwrap();
        x.add(&cube, &cube).unwrap();
        x.fetch_all().unwrap().to_vec()
    });
    let expected: Vec<f32> = (0..16).map(|v| 2.0 * v as f32).collect();
    for values in results {
        assert_eq!(values, expected);
    }
}

#[test]
fn test_broadcast_ops_partitioned() {
    let results = run_local_group(3, |group| {
        let mut m = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        m.add_row(&ramp(&[3], 1.0, 1.0)).unwrap();
        m.add_col(&ramp(&[4], 10.0, 10.0)).unwrap();

        let mut column_sums = DistributedArray::partitioned(Shape::from([3]), 0, &group).unwrap();
        column_sums.sum_rows(&m).unwrap();
        let mut row_sums = DistributedArray::local(Shape::from([4]));
        row_sums.sum_cols(&m).unwrap();

        (
            m.fetch_all().unwrap().to_vec(),
            column_sums.fetch_all().unwrap().to_vec(),
            row_sums.fetch_all().unwrap().to_vec(),
        )
    });
    for (m, column_sums, row_sums) in results {
        assert_eq!(
            m,
            vec![11.0, 12.0, 13.0, 21.0, 22.0, 23.0, 31.0, 32.0, 33.0, 41.0, 42.0, 43.0]
        );
        assert_eq!(column_sums, vec![104.0, 108.0, 112.0]);
        assert_eq!(row_sums, vec![36.0, 66.0, 96.0, 126.0]);
    }
}

#[test]
fn test_reductions_partitioned() {
    let results = run_local_group(2, |group| {
        let mut x = DistributedArray::partitioned(Shape::from([5, 2]), 0, &group).unwrap();
        x.minus_scalar(&ramp(&[5, 2], 1.0, 0.0), 4.5).unwrap();
        (
            x.sum().unwrap(),
            x.max().unwrap(),
            x.min().unwrap(),
            x.norm1().unwrap(),
        )
    });
    for result in results {
        assert_eq!(result, (0.0, 4.5, -4.5, 25.0));
    }
}

#[test]
fn test_collective_dot_with_partitioned_operands() {
    let a = ramp(&[4, 3], 1.0, 0.0);
    let b = ramp(&[3, 5], 0.5, 0.0);
    let mut expected = DistributedArray::local(Shape::from([4, 5]));
    expected.dot(&a, &b, false, false, true).unwrap();
    let expected = expected.fetch_all().unwrap().to_vec();

    let results = run_local_group(3, |group| {
        let mut a = DistributedArray::partitioned(Shape::from([4, 3]), 1, &group).unwrap();
        a.copy_from(&ramp(&[4, 3], 1.0, 0.0)).unwrap();
        let mut b = DistributedArray::partitioned(Shape::from([3, 5]), 0, &group).unwrap();
        b.copy_from(&ramp(&[3, 5], 0.5, 0.0)).unwrap();
        let mut c = DistributedArray::partitioned(Shape::from([4, 5]), 1, &group).unwrap();

        c.dot(&a, &b, false, false, true).unwrap();
        let plain = c.fetch_all().unwrap().to_vec();

        // A stored transposed
        let a_t_data = (0..12).map(|idx| ((idx % 4) * 3 + idx / 4) as f32).collect();
        let a_t = DistributedArray::from_local(LocalArray::from_vec(Shape::from([3, 4]), a_t_data));
        c.dot(&a_t, &b, true, false, true).unwrap();
        let transposed = c.fetch_all().unwrap().to_vec();

        c.dot(&a, &b, false, false, false).unwrap();
        let accumulated = c.fetch_all().unwrap().to_vec();
        (plain, transposed, accumulated)
    });

    let doubled: Vec<f32> = expected.iter().map(|v| 2.0 * v).collect();
    for (plain, transposed, accumulated) in results {
        assert_eq!(plain, expected);
        assert_eq!(transposed, expected);
        assert_eq!(accumulated, doubled);
    }
}

#[test]
fn test_index_views_on_partitioned_array() {
    let results = run_local_group(2, |group| {
        let mut m = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        m.copy_from(&ramp(&[4, 3], 1.0, 0.0)).unwrap();
        let mut row = m.index(2);
        let before = row.fetch_all().unwrap().to_vec();
        row.fill(-1.0).unwrap();
        (before, row.partition_dim(), m.sum().unwrap())
    });
    for (before, dim, sum) in results {
        assert_eq!(before, vec![6.0, 7.0, 8.0]);
        assert_eq!(dim, None);
        assert_eq!(sum, 42.0);
    }
}

#[test]
fn test_reshape_partitioned_views() {
    let results = run_local_group(2, |group| {
        let t = DistributedArray::partitioned(Shape::from([2, 4, 3]), 1, &group).unwrap();
        let mut slice = t.index(1);
        slice.fill(1.0).unwrap();

        let flat_fails = slice.reshape(Shape::from([12])).is_err();
        let split_fails = slice.reshape(Shape::from([2, 2, 3])).is_err();
        let whole_fails = t.reshape(Shape::from([8, 3])).is_err();
        let column = slice.reshape(Shape::from([4, 3, 1])).unwrap();
        (
            slice.partition_dim(),
            flat_fails && split_fails && whole_fails,
            column.partition_dim(),
            column.at(&[3, 2, 0]).unwrap(),
            t.at(&[0, 0, 0]).unwrap(),
            t.sum().unwrap(),
        )
    });
    for result in results {
        assert_eq!(result, (Some(0), true, Some(0), 1.0, 0.0, 12.0));
    }
}

#[test]
#[should_panic(expected = "setup disagreement")]
fn test_setup_mismatch_is_fatal() {
    run_local_group(2, |group| {
        let extents = if group.rank() == 0 { [4, 4] } else { [4, 5] };
        let _ = DistributedArray::partitioned(Shape::from(extents), 0, &group);
    });
}

#[test]
fn test_sub_array_of_partitioned_is_local() {
    let results = run_local_group(2, |group| {
        let mut m = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        m.copy_from(&ramp(&[4, 3], 1.0, 0.0)).unwrap();
        // rows 1..3 straddle both ranks
        let sub = m.sub_array(&Range::new(vec![1, 1], vec![3, 3])).unwrap();
        (sub.is_global(), sub.partition_dim(), sub.shape().clone(), sub.fetch_all().unwrap().to_vec())
    });
    for (global, dim, shape, values) in results {
        assert!(!global);
        assert_eq!(dim, None);
        assert_eq!(shape, Shape::from([2, 2]));
        assert_eq!(values, vec![4.0, 5.0, 7.0, 8.0]);
    }
}

#[test]
#[should_panic(expected = "outside")]
fn test_fetch_outside_partitioned_is_fatal() {
    run_local_group(2, |group| {
        let m = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        let _ = m.fetch(&Range::new(vec![0, 0], vec![5, 3]));
    });
}

#[test]
#[should_panic(expected = "outside")]
fn test_put_outside_partitioned_is_fatal() {
    run_local_group(2, |group| {
        let mut m = DistributedArray::partitioned(Shape::from([4, 3]), 0, &group).unwrap();
        let _ = m.put(&Range::new(vec![3, 2], vec![4, 4]), &[1.0, 1.0]);
    });
}

#[test]
#[should_panic(expected = "add: destination")]
fn test_volume_mismatch_is_fatal() {
    let mut c = DistributedArray::local(Shape::from([2, 2]));
    let a = DistributedArray::local(Shape::from([3]));
    let _ = c.add(&a, &a);
}
