use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUF_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

#[derive(Debug)]
pub struct SpliceOutcome {
    /// The direction whose copy finished first and tore the pair down.
    pub ended: Direction,
    pub error: Option<io::Error>,
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Join two streams as a linked pair.
///
/// Bytes flow both ways until either direction hits EOF or an error; then
/// both streams are shut down and dropped. Half-open pairs never outlive
/// this call.
pub async fn splice<A, B>(a: A, b: B) -> SpliceOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let mut a_to_b = 0u64;
    let mut b_to_a = 0u64;

    let (ended, res) = tokio::select! {
        res = copy_counted(&mut ar, &mut bw, &mut a_to_b) => (Direction::AToB, res),
        res = copy_counted(&mut br, &mut aw, &mut b_to_a) => (Direction::BToA, res),
    };

    let _ = aw.shutdown().await;
    let _ = bw.shutdown().await;

    SpliceOutcome {
        ended,
        error: res.err(),
        a_to_b,
        b_to_a,
    }
}

async fn copy_counted<R, W>(r: &mut R, w: &mut W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        *count += n as u64;
    }
}
