//! Certificate acquisition for the CLI: a self-signed generator and an
//! ACME HTTP-01 client. Both write `<host>.crt` and `<host>.key` in the
//! working directory.

use crate::prelude::{networking::*, *};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL;
use base64::Engine;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde_json::{json, Value};

/// The Let's Encrypt v2 directory.
const DIRECTORY_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// How long certificates from [`generate`] stay valid.
const VALIDITY_DAYS: i64 = 365;

fn invalid(err: impl Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

fn new_params(host: &str) -> io::Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![host.to_string()]).map_err(invalid)?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, host);
    Ok(params)
}

/// Writes a P-256 ECDSA self-signed certificate for `host`, valid for
/// 365 days, with CN and SAN equal to `host`.
///
/// # Errors
///
/// Fails on key generation, signing, or file-write errors.
pub fn generate(host: &str) -> io::Result<()> {
    let mut params = new_params(host)?;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(invalid)?;
    let cert = params.self_signed(&key_pair).map_err(invalid)?;

    let cert_path = format!("{host}.crt");
    let key_path = format!("{host}.key");
    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    println!("Generated self-signed cert: {cert_path} and {key_path}");
    Ok(())
}

/// Runs an ACME HTTP-01 flow on port 80 for `host` against Let's
/// Encrypt, then writes `<host>.crt` and `<host>.key`.
///
/// # Errors
///
/// Fails when port 80 cannot be bound, on any directory or order error,
/// and when the authorization ends up invalid.
pub async fn obtain(host: &str) -> io::Result<()> {
    let mut acme = Acme::connect().await?;
    let account = acme
        .post(
            &acme.new_account.clone(),
            Some(json!({ "termsOfServiceAgreed": true })),
        )
        .await?;
    let kid = header(&account, "location")?;
    acme.kid = Some(kid);

    let order = acme
        .post(
            &acme.new_order.clone(),
            Some(json!({ "identifiers": [{ "type": "dns", "value": host }] })),
        )
        .await?;
    let order_url = header(&order, "location")?;
    let order: Value = order.json().await.map_err(invalid)?;
    let authorization = order["authorizations"][0]
        .as_str()
        .ok_or_else(|| invalid("order carries no authorization"))?
        .to_string();
    let finalize = order["finalize"]
        .as_str()
        .ok_or_else(|| invalid("order carries no finalize url"))?
        .to_string();

    let authz: Value = acme.post(&authorization, None).await?.json().await.map_err(invalid)?;
    let challenge = authz["challenges"]
        .as_array()
        .and_then(|challenges| {
            challenges
                .iter()
                .find(|challenge| challenge["type"] == "http-01")
        })
        .ok_or_else(|| invalid("no http-01 challenge offered"))?;
    let token = challenge["token"]
        .as_str()
        .ok_or_else(|| invalid("challenge carries no token"))?
        .to_string();
    let challenge_url = challenge["url"]
        .as_str()
        .ok_or_else(|| invalid("challenge carries no url"))?
        .to_string();

    let key_authorization = format!("{token}.{}", acme.thumbprint());
    let responder = tokio::spawn(respond_challenges(token.clone(), key_authorization));
    println!("Started HTTP server on port 80 for the ACME challenge.");

    acme.post(&challenge_url, Some(json!({}))).await?;
    poll(&mut acme, &authorization, "authorization").await?;

    // the certificate gets its own key, separate from the account key
    let cert_key = KeyPair::generate().map_err(invalid)?;
    let csr = new_params(host)?
        .serialize_request(&cert_key)
        .map_err(invalid)?;
    acme.post(
        &finalize,
        Some(json!({ "csr": BASE64_URL.encode(csr.der()) })),
    )
    .await?;
    let order = poll(&mut acme, &order_url, "order").await?;
    responder.abort();

    let certificate = order["certificate"]
        .as_str()
        .ok_or_else(|| invalid("order carries no certificate url"))?
        .to_string();
    let chain = acme
        .post(&certificate, None)
        .await?
        .text()
        .await
        .map_err(invalid)?;

    let cert_path = format!("{host}.crt");
    let key_path = format!("{host}.key");
    std::fs::write(&cert_path, chain)?;
    std::fs::write(&key_path, cert_key.serialize_pem())?;
    println!("Obtained TLS certificate: {cert_path} and {key_path}");
    Ok(())
}

async fn poll(acme: &mut Acme, url: &str, what: &str) -> io::Result<Value> {
    for _ in 0..30 {
        let state: Value = acme.post(url, None).await?.json().await.map_err(invalid)?;
        match state["status"].as_str() {
            Some("valid") => return Ok(state),
            Some("invalid") => return Err(invalid(format!("{what} became invalid"))),
            _ => tokio::time::sleep(Duration::from_secs(2)).await,
        }
    }
    Err(invalid(format!("{what} did not validate in time")))
}

/// Serves `/.well-known/acme-challenge/<token>` on port 80 until aborted.
async fn respond_challenges(token: String, key_authorization: String) -> io::Result<()> {
    let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, 80)).await?;
    let path = format!("/.well-known/acme-challenge/{token}");
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        if stream.read_line(&mut line).await.is_err() {
            continue;
        }
        // drain the header section
        loop {
            let mut header = String::new();
            match stream.read_line(&mut header).await {
                Ok(0) | Err(_) => break,
                Ok(_) if header == "\r\n" || header == "\n" => break,
                Ok(_) => {}
            }
        }
        let requested = line.split_whitespace().nth(1).unwrap_or("");
        println!("[ACME] Challenge requested: {requested}");
        let response = if requested == path {
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
                key_authorization.len(),
                key_authorization
            )
        } else {
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string()
        };
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.flush().await;
    }
}

struct Acme {
    client: reqwest::Client,
    key: EcdsaKeyPair,
    rng: SystemRandom,
    kid: Option<String>,
    nonce: Option<String>,
    new_nonce: String,
    new_account: String,
    new_order: String,
}
impl Acme {
    async fn connect() -> io::Result<Self> {
        let client = reqwest::Client::new();
        let directory: Value = client
            .get(DIRECTORY_URL)
            .send()
            .await
            .map_err(invalid)?
            .json()
            .await
            .map_err(invalid)?;
        let endpoint = |name: &str| -> io::Result<String> {
            directory[name]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("directory carries no {name}")))
        };

        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| invalid("account key generation failed"))?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|_| invalid("account key rejected"))?;

        Ok(Self {
            client,
            key,
            rng,
            kid: None,
            nonce: None,
            new_nonce: endpoint("newNonce")?,
            new_account: endpoint("newAccount")?,
            new_order: endpoint("newOrder")?,
        })
    }

    /// The account public key as a JWK, with lexicographic members as the
    /// thumbprint computation requires.
    fn jwk(&self) -> Value {
        // uncompressed point: 0x04, then 32 bytes x, then 32 bytes y
        let point = self.key.public_key().as_ref();
        json!({
            "crv": "P-256",
            "kty": "EC",
            "x": BASE64_URL.encode(&point[1..33]),
            "y": BASE64_URL.encode(&point[33..65]),
        })
    }

    fn thumbprint(&self) -> String {
        // serde_json emits object members sorted by key, which is the
        // lexicographic order the thumbprint needs
        let jwk = self.jwk().to_string();
        let digest = ring::digest::digest(&ring::digest::SHA256, jwk.as_bytes());
        BASE64_URL.encode(digest)
    }

    async fn take_nonce(&mut self) -> io::Result<String> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }
        let response = self
            .client
            .head(&self.new_nonce)
            .send()
            .await
            .map_err(invalid)?;
        header(&response, "replay-nonce")
    }

    /// Signed POST; a [`None`] payload is a POST-as-GET.
    async fn post(
        &mut self,
        url: &str,
        payload: Option<Value>,
    ) -> io::Result<reqwest::Response> {
        let nonce = self.take_nonce().await?;
        let mut protected = json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match &self.kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = self.jwk(),
        }

        let protected = BASE64_URL.encode(protected.to_string());
        let payload = match payload {
            Some(payload) => BASE64_URL.encode(payload.to_string()),
            None => String::new(),
        };
        let signature = self
            .key
            .sign(&self.rng, format!("{protected}.{payload}").as_bytes())
            .map_err(|_| invalid("signing failed"))?;

        let body = json!({
            "protected": protected,
            "payload": payload,
            "signature": BASE64_URL.encode(signature.as_ref()),
        });
        let response = self
            .client
            .post(url)
            .header("content-type", "application/jose+json")
            .body(body.to_string())
            .send()
            .await
            .map_err(invalid)?;

        if let Some(nonce) = response
            .headers()
            .get("replay-nonce")
            .and_then(|v| v.to_str().ok())
        {
            self.nonce = Some(nonce.to_string());
        }
        if response.status().is_client_error() || response.status().is_server_error() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            return Err(invalid(format!("acme request failed ({status}): {details}")));
        }
        Ok(response)
    }
}

fn header(response: &reqwest::Response, name: &str) -> io::Result<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("response carries no {name} header")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_writes_pem_pair() {
        let dir = std::env::temp_dir().join(format!("iridium-cert-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(&dir).unwrap();
        let result = generate("localhost.test");
        std::env::set_current_dir(cwd).unwrap();
        result.unwrap();

        let cert = std::fs::read_to_string(dir.join("localhost.test.crt")).unwrap();
        let key = std::fs::read_to_string(dir.join("localhost.test.key")).unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn jwk_point_is_split_correctly() {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        let acme = Acme {
            client: reqwest::Client::new(),
            key,
            rng,
            kid: None,
            nonce: None,
            new_nonce: String::new(),
            new_account: String::new(),
            new_order: String::new(),
        };
        let jwk = acme.jwk();
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["kty"], "EC");
        // both coordinates are 32 bytes, so 43 base64url characters
        assert_eq!(jwk["x"].as_str().unwrap().len(), 43);
        assert_eq!(jwk["y"].as_str().unwrap().len(), 43);
        // the thumbprint is a 32-byte digest
        assert_eq!(acme.thumbprint().len(), 43);
    }
}
