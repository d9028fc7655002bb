use bson::{rawdoc, Document};

use crate::{
    cmap::{Command, Connection},
    error::{Error, Result},
    options::Credential,
};

/// Constructs the first client message in the X.509 handshake for speculative authentication.
pub(crate) fn build_speculative_client_first(credential: &Credential) -> Command {
    build_client_first(credential)
}

/// Constructs the first client message in the X.509 handshake.
pub(crate) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = rawdoc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.append("user", username.as_str());
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// Sends the first client message in the X.509 handshake and reads the server's response.
pub(crate) async fn send_client_first(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<Document> {
    let command = build_client_first(credential);
    let response = conn.send_command(command).await?;
    response.auth_response_body("MONGODB-X509")
}

/// Performs X.509 authentication for a given stream. If the handshake included a speculative
/// authentication attempt, the server's response to that attempt is validated instead of
/// starting a fresh conversation.
pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    let server_response = match server_first.into() {
        Some(server_first) => server_first,
        None => send_client_first(conn, credential).await?,
    };

    if server_response.get_str("dbname") != Ok("$external") {
        return Err(Error::authentication_error(
            "MONGODB-X509",
            "Authentication failed",
        ));
    }

    Ok(())
}
