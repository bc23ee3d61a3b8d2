use std::io::{Read, Write};

use tracing::{debug, warn};

use crate::errors::OperationError;
use crate::protocol::{parse_response, send_command, Opcode};

const MECH_PLAIN: &str = "PLAIN";

/// Runs the SASL handshake on a freshly dialed connection, before the pool
/// hands it to anyone.
///
/// Only PLAIN is spoken. A server that does not offer it leaves the
/// connection as it is; that is reported but not treated as a failure.
pub fn negotiate<C: Read + Write + ?Sized>(
    conn: &mut C,
    user: &str,
    password: &str,
) -> Result<(), OperationError> {
    if user.is_empty() && password.is_empty() {
        return Ok(());
    }

    send_command(conn, Opcode::AuthList, b"", b"", 0, b"")?;
    let mechs = parse_response(conn, "", 0)?;
    let mechs = String::from_utf8_lossy(&mechs.value);
    if !offers(&mechs, MECH_PLAIN) {
        warn!(
            mechanisms = %mechs,
            "server offers no supported auth mechanism, continuing unauthenticated"
        );
        return Ok(());
    }

    let payload = plain_payload(user, password);
    send_command(conn, Opcode::AuthStart, MECH_PLAIN.as_bytes(), &payload, 0, b"")?;
    parse_response(conn, MECH_PLAIN, 0)?;
    debug!(user, "authenticated with {}", MECH_PLAIN);
    Ok(())
}

fn offers(mechs: &str, wanted: &str) -> bool {
    mechs
        .split(|c: char| c.is_whitespace() || c == ',')
        .any(|mech| mech == wanted)
}

// RFC 4616: authzid NUL authcid NUL passwd, with an empty authzid.
fn plain_payload(user: &str, password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(user.len() + password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(user.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload
}
