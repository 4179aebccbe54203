#![cfg(unix)]

use std::io::{self, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use iomux_core::{Error, Mux, Record, TransportKind};

fn mux_for<T: Clone + PartialEq>(transport: TransportKind) -> Option<Mux<T>> {
    match Mux::with_transport(transport) {
        Ok(mux) => Some(mux),
        Err(err) if err.is_unsupported() => {
            eprintln!("skipping {transport}: {err}");
            None
        }
        Err(err) => panic!("failed to create {transport} multiplexer: {err}"),
    }
}

fn shape<T: Clone>(records: &[Record<T>]) -> Vec<(T, String)> {
    records
        .iter()
        .map(|r| (r.tag.clone(), r.text().into_owned()))
        .collect()
}

#[test]
fn two_tags_in_write_order() {
    for transport in TransportKind::ALL {
        let Some(mux) = mux_for::<&str>(transport) else {
            continue;
        };
        let mut a = mux.tag("a").unwrap();
        let mut b = mux.tag("b").unwrap();

        let records = mux
            .read_while(|| {
                a.write_all(b"hello taga")?;
                b.write_all(b"hello tagb")?;
                Ok::<(), io::Error>(())
            })
            .unwrap();

        assert_eq!(
            shape(&records),
            vec![("a", "hello taga".into()), ("b", "hello tagb".into())],
            "{transport}"
        );
    }
}

#[test]
fn interleaved_writes_keep_tag_order() {
    for transport in TransportKind::ALL {
        let Some(mux) = mux_for::<&str>(transport) else {
            continue;
        };
        let mut a = mux.tag("a").unwrap();
        let mut b = mux.tag("b").unwrap();
        let mut c = mux.tag("c").unwrap();

        let records = mux
            .read_while(|| {
                a.write_all(b"out1")?;
                b.write_all(b"err1")?;
                b.write_all(b"err2")?;
                c.write_all(b"other")?;
                Ok::<(), io::Error>(())
            })
            .unwrap();

        let got = shape(&records);
        if transport.preserves_boundaries() {
            assert_eq!(
                got,
                vec![
                    ("a", "out1".into()),
                    ("b", "err1".into()),
                    ("b", "err2".into()),
                    ("c", "other".into()),
                ],
                "{transport}"
            );
        } else {
            assert_eq!(
                got,
                vec![
                    ("a", "out1".into()),
                    ("b", "err1err2".into()),
                    ("c", "other".into()),
                ],
                "{transport}"
            );
        }
    }
}

#[test]
fn child_process_output_is_tagged() {
    for transport in TransportKind::ALL {
        let Some(mux) = mux_for::<i32>(transport) else {
            continue;
        };
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out1 && echo err1 1>&2 && echo out2"]);
        cmd.stdout(Stdio::from(mux.tag(0).unwrap()));
        cmd.stderr(Stdio::from(mux.tag(1).unwrap()));

        let records = mux
            .read_while(move || {
                let status = cmd.status()?;
                assert!(status.success());
                Ok::<(), io::Error>(())
            })
            .unwrap();

        let joined = |tag: i32| -> String {
            records
                .iter()
                .filter(|r| r.tag == tag)
                .map(|r| r.text().into_owned())
                .collect()
        };
        assert_eq!(records[0].tag, 0, "{transport}");
        assert!(records[0].text().starts_with("out1\n"), "{transport}");
        assert_eq!(joined(0), "out1\nout2\n", "{transport}");
        assert_eq!(joined(1), "err1\n", "{transport}");
        if transport.preserves_boundaries() {
            assert_eq!(records.len(), 3, "{transport}");
        }
    }
}

#[test]
fn empty_write_keeps_the_tag_alive() {
    for transport in TransportKind::ALL {
        let Some(mux) = mux_for::<&str>(transport) else {
            continue;
        };
        let mut a = mux.tag("a").unwrap();

        let records = mux
            .read_while(|| {
                assert_eq!(a.write(b"")?, 0);
                a.write_all(b"after empty")?;
                Ok::<(), io::Error>(())
            })
            .unwrap();

        assert_eq!(shape(&records), vec![("a", "after empty".into())], "{transport}");
        assert_eq!(mux.len(), 1, "{transport}");
    }
}

#[test]
fn concurrent_producers_keep_per_tag_order() {
    for transport in TransportKind::ALL {
        let Some(mux) = mux_for::<usize>(transport) else {
            continue;
        };
        let writers: Vec<_> = (0..4).map(|i| mux.tag(i).unwrap()).collect();

        let records = mux
            .read_while(move || {
                let handles: Vec<_> = writers
                    .into_iter()
                    .map(|mut w| {
                        thread::spawn(move || -> io::Result<()> {
                            for n in 0..20 {
                                write!(w, "{n};")?;
                            }
                            Ok(())
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().expect("producer panicked")?;
                }
                Ok::<(), io::Error>(())
            })
            .unwrap();

        let expected: String = (0..20).map(|n| format!("{n};")).collect();
        for tag in 0..4 {
            let got: String = records
                .iter()
                .filter(|r| r.tag == tag)
                .map(|r| r.text().into_owned())
                .collect();
            assert_eq!(got, expected, "{transport} tag {tag}");
        }
    }
}

#[test]
fn read_returns_single_chunks() {
    for transport in TransportKind::ALL {
        let Some(mux) = mux_for::<char>(transport) else {
            continue;
        };
        let mut x = mux.tag('x').unwrap();
        x.write_all(b"first").unwrap();
        x.write_all(b"second").unwrap();

        let first = mux.read().unwrap();
        assert_eq!(first.tag, 'x');
        if transport.preserves_boundaries() {
            assert_eq!(first.text(), "first");
            assert_eq!(mux.read().unwrap().text(), "second");
        } else {
            assert!(b"firstsecond".starts_with(&first.data));
        }
    }
}

#[test]
fn close_from_another_thread_interrupts_read_while() {
    let mux = Arc::new(Mux::<&str>::new().unwrap());
    let _a = mux.tag("a").unwrap();
    let closer = Arc::clone(&mux);

    let err = mux
        .read_while(move || {
            closer.close().map_err(io::Error::other)?;
            Ok::<(), io::Error>(())
        })
        .unwrap_err();

    assert!(matches!(err.error, iomux_core::DrainError::Mux(Error::Closed)));
    assert!(err.records.is_empty());
    assert!(matches!(mux.read(), Err(Error::Closed)));
}
