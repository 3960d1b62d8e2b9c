//! End-to-end channel behavior across routines

use routines::{go, Channel, GoOptions, RuntimeError, Timeout};

#[tokio::test]
async fn rendezvous_handoff_between_routines() {
    let chan: Channel<&str> = Channel::unbuffered();

    let tx = chan.clone();
    let sender = go(
        move || async move { tx.send_timeout("hello", Timeout::Millis(1000)).await },
        GoOptions::named("sender"),
    );
    let rx = chan.clone();
    let receiver = go(
        move || async move { rx.receive_timeout(Timeout::Millis(1000)).await },
        GoOptions::named("receiver"),
    );

    assert_eq!(receiver.join().await.unwrap(), "hello");
    sender.join().await.unwrap();
}

#[tokio::test]
async fn close_before_receiver_fails_the_parked_sender() {
    let chan: Channel<&str> = Channel::unbuffered();

    let tx = chan.clone();
    let sender = go(
        move || async move { tx.send_timeout("hello", Timeout::Infinite).await },
        GoOptions::default(),
    );
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    chan.close().unwrap();
    let err = sender.join().await.unwrap_err();
    assert_eq!(err, RuntimeError::ChannelClosed);
}

#[tokio::test]
async fn producer_consumer_respects_capacity_and_order() {
    let chan = Channel::buffered(3).unwrap();

    let tx = chan.clone();
    let producer = go(
        move || async move {
            for i in 1..=10 {
                tx.send_timeout(i, Timeout::Millis(2000)).await?;
            }
            Ok(())
        },
        GoOptions::named("producer"),
    );

    let rx = chan.clone();
    let watcher = chan.clone();
    let consumer = go(
        move || async move {
            let mut got = Vec::new();
            for _ in 0..10 {
                // The buffer bound holds at every observation point.
                assert!(watcher.len() <= 3);
                got.push(rx.receive_timeout(Timeout::Millis(2000)).await?);
            }
            Ok(got)
        },
        GoOptions::named("consumer"),
    );

    producer.join().await.unwrap();
    let got = consumer.join().await.unwrap();
    assert_eq!(got, (1..=10).collect::<Vec<i32>>());
    assert_eq!(chan.len(), 0);
}

#[tokio::test]
async fn buffered_values_survive_close_and_nothing_is_duplicated() {
    let chan = Channel::buffered(5).unwrap();
    for i in 0..5 {
        chan.send(i).await.unwrap();
    }
    chan.close().unwrap();

    let mut drained = Vec::new();
    loop {
        match chan.receive().await {
            Ok(v) => drained.push(v),
            Err(err) => {
                assert_eq!(err, RuntimeError::ChannelClosedEmpty);
                break;
            }
        }
    }
    assert_eq!(drained, vec![0, 1, 2, 3, 4]);
}
