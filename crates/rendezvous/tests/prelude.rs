use rendezvous::prelude::*;

#[tokio::test]
async fn prelude_covers_a_full_transfer() {
    let table = LocalRendezvous::new();
    let attrs = SliceAttrs::new("/cpu:0", 9, "/cpu:1", "x", DataType::Int64).with_slice_size(16);
    let ctx = SessionContext::new(FrameAndIter::new(1, 1));

    let value = Array::from_i64s(Shape::new([3, 3]), &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
    SliceSender::new(attrs.clone())
        .unwrap()
        .send(&*table, &ctx, &value, false)
        .unwrap();
    let received = SliceReceiver::new(attrs).unwrap().recv(&*table, &ctx).await.unwrap();

    assert_eq!(received.value, value);
    assert_eq!(table.pending_len(), 0);
}

#[tokio::test]
async fn plain_channels_are_reachable_through_the_facade() {
    let table = LocalRendezvous::new();
    let key = rendezvous::ParsedKey::from_parts("/cpu:0", 1, "/cpu:1", "k", FrameAndIter::default())
        .unwrap();

    table.send(&key, &Args::new(), Array::i64_vector(&[5]), false).unwrap();
    let delivery = table.recv(&key, &Args::new(), None).await.unwrap();
    assert_eq!(delivery.value.to_i64s().unwrap(), vec![5]);
}
