use easy_error::{Error, bail};

use super::Socket;

/// Sends `buf[..len]`, moving any unsent remainder to the front of `buf`
/// before retrying so each retry starts at offset 0.
pub async fn send_fully<S>(socket: &S, buf: &mut [u8], len: usize) -> Result<(), Error>
where
    S: Socket + ?Sized,
{
    let mut len = len;
    while len > 0 {
        let sent = socket.send(&buf[..len]).await?;
        if sent == 0 {
            bail!("send returned zero with {} bytes pending", len);
        }
        if sent < len {
            buf.copy_within(sent..len, 0);
        }
        len -= sent;
    }
    Ok(())
}
