//! `crypto` global: `getRandomValues`, `randomUUID` and the
//! `crypto.subtle` subset workers rely on — digest, HMAC, AES-GCM,
//! RSA-OAEP and ECDSA P-256.
//!
//! All operations complete synchronously on the isolate thread and are
//! surfaced as already-settled promises, which is indistinguishable
//! from async completion at the JS contract level.

use std::rc::Rc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit as AeadKeyInit, Nonce};
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rand::rngs::OsRng;
use rand::RngCore;
use rquickjs::class::Trace;
use rquickjs::prelude::Opt;
use rquickjs::{Class, Ctx, Exception, FromJs, JsLifetime, Object, Result, Value};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};

use p256::elliptic_curve::sec1::ToEncodedPoint;

use super::events::throw_dom;
use super::support::{self, arg, as_bytes, bytes_to_array_buffer, native_fn};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Hash {
    Sha256,
    Sha384,
    Sha512,
}

impl Hash {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA-256" => Some(Self::Sha256),
            "SHA-384" => Some(Self::Sha384),
            "SHA-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
            let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
                .expect("hmac accepts any key length");
            Mac::update(&mut mac, data);
            mac.finalize().into_bytes().to_vec()
        }
        match self {
            Self::Sha256 => mac::<Hmac<Sha256>>(key, data),
            Self::Sha384 => mac::<Hmac<Sha384>>(key, data),
            Self::Sha512 => mac::<Hmac<Sha512>>(key, data),
        }
    }
}

#[derive(Clone)]
enum KeyMaterial {
    Secret(Rc<Vec<u8>>),
    EcPrivate(Rc<SigningKey>),
    EcPublic(Rc<VerifyingKey>),
    RsaPrivate(Rc<RsaPrivateKey>),
    RsaPublic(Rc<RsaPublicKey>),
}

#[rquickjs::class]
#[derive(Clone, Trace, JsLifetime)]
pub struct CryptoKey {
    #[qjs(skip_trace)]
    algorithm_name: String,
    #[qjs(skip_trace)]
    hash: Option<Hash>,
    #[qjs(get)]
    extractable: bool,
    #[qjs(skip_trace)]
    usages: Vec<String>,
    #[qjs(skip_trace)]
    material: KeyMaterial,
}

#[rquickjs::methods]
impl CryptoKey {
    #[qjs(get, rename = "type")]
    pub fn key_type(&self) -> &'static str {
        match self.material {
            KeyMaterial::Secret(_) => "secret",
            KeyMaterial::EcPrivate(_) | KeyMaterial::RsaPrivate(_) => "private",
            KeyMaterial::EcPublic(_) | KeyMaterial::RsaPublic(_) => "public",
        }
    }

    #[qjs(get)]
    pub fn algorithm<'js>(&self, ctx: Ctx<'js>) -> Result<Object<'js>> {
        let algorithm = Object::new(ctx.clone())?;
        algorithm.set("name", self.algorithm_name.clone())?;
        if let Some(hash) = self.hash {
            let hash_obj = Object::new(ctx)?;
            hash_obj.set(
                "name",
                match hash {
                    Hash::Sha256 => "SHA-256",
                    Hash::Sha384 => "SHA-384",
                    Hash::Sha512 => "SHA-512",
                },
            )?;
            algorithm.set("hash", hash_obj)?;
        }
        Ok(algorithm)
    }

    #[qjs(get)]
    pub fn usages(&self) -> Vec<String> {
        self.usages.clone()
    }
}

/// Parses an AlgorithmIdentifier: a bare name string or `{name, hash}`.
fn parse_algorithm<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<(String, Option<Hash>)> {
    if let Some(s) = value.as_string() {
        return Ok((s.to_string()?, None));
    }
    if let Some(obj) = value.as_object() {
        let name: String = obj
            .get("name")
            .map_err(|_| Exception::throw_type(ctx, "algorithm is missing a name"))?;
        let hash = match obj.get::<_, Value>("hash") {
            Ok(h) if h.is_string() => Hash::parse(&h.as_string().unwrap().to_string()?),
            Ok(h) => h
                .as_object()
                .and_then(|o| o.get::<_, String>("name").ok())
                .and_then(|n| Hash::parse(&n)),
            Err(_) => None,
        };
        return Ok((name, hash));
    }
    Err(Exception::throw_type(ctx, "invalid algorithm identifier"))
}

fn get_key<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Result<CryptoKey> {
    Class::<CryptoKey>::from_js(ctx, value.clone())
        .map(|k| k.borrow().clone())
        .map_err(|_| Exception::throw_type(ctx, "expected a CryptoKey"))
}

fn settle<'js>(ctx: &Ctx<'js>, result: Result<Value<'js>>) -> Result<Value<'js>> {
    match result {
        Ok(value) => Ok(support::resolved_promise(ctx, value)?.into_value()),
        Err(e) => {
            let err = support::caught_value(ctx, e);
            Ok(support::rejected_promise(ctx, err)?.into_value())
        }
    }
}

fn subtle_digest<'js>(ctx: &Ctx<'js>, algo: &Value<'js>, data: &Value<'js>) -> Result<Value<'js>> {
    let (name, _) = parse_algorithm(ctx, algo)?;
    let hash = Hash::parse(&name)
        .ok_or_else(|| throw_dom(ctx, "NotSupportedError", "unsupported digest algorithm"))?;
    let data = as_bytes(data)?;
    Ok(bytes_to_array_buffer(ctx, &hash.digest(&data))?.into_value())
}

fn subtle_import_key<'js>(
    ctx: &Ctx<'js>,
    format: &str,
    key_data: &Value<'js>,
    algo: &Value<'js>,
    extractable: bool,
    usages: Vec<String>,
) -> Result<Value<'js>> {
    let (name, hash) = parse_algorithm(ctx, algo)?;
    let upper = name.to_ascii_uppercase();
    let bytes = as_bytes(key_data)?;

    let material = match (format, upper.as_str()) {
        ("raw", "HMAC") | ("raw", "AES-GCM") => KeyMaterial::Secret(Rc::new(bytes)),
        ("pkcs8", "ECDSA") => KeyMaterial::EcPrivate(Rc::new(
            SigningKey::from_pkcs8_der(&bytes)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid EC key: {e}")))?,
        )),
        ("spki", "ECDSA") => KeyMaterial::EcPublic(Rc::new(
            VerifyingKey::from_public_key_der(&bytes)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid EC key: {e}")))?,
        )),
        ("raw", "ECDSA") => KeyMaterial::EcPublic(Rc::new(
            VerifyingKey::from_sec1_bytes(&bytes)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid EC point: {e}")))?,
        )),
        ("pkcs8", "RSA-OAEP") => KeyMaterial::RsaPrivate(Rc::new(
            rsa::pkcs8::DecodePrivateKey::from_pkcs8_der(&bytes)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid RSA key: {e}")))?,
        )),
        ("spki", "RSA-OAEP") => KeyMaterial::RsaPublic(Rc::new(
            rsa::pkcs8::DecodePublicKey::from_public_key_der(&bytes)
                .map_err(|e| Exception::throw_type(ctx, &format!("invalid RSA key: {e}")))?,
        )),
        _ => {
            return Err(throw_dom(
                ctx,
                "NotSupportedError",
                &format!("unsupported key import: format {format:?} for {name}"),
            ))
        }
    };

    let key = CryptoKey {
        algorithm_name: upper,
        hash,
        extractable,
        usages,
        material,
    };
    Ok(Class::instance(ctx.clone(), key)?.into_value())
}

fn subtle_generate_key<'js>(
    ctx: &Ctx<'js>,
    algo: &Value<'js>,
    extractable: bool,
    usages: Vec<String>,
) -> Result<Value<'js>> {
    let (name, hash) = parse_algorithm(ctx, algo)?;
    let upper = name.to_ascii_uppercase();
    let material = match upper.as_str() {
        "AES-GCM" => {
            let length: usize = algo
                .as_object()
                .and_then(|o| o.get::<_, usize>("length").ok())
                .unwrap_or(256);
            if length != 128 && length != 256 {
                return Err(throw_dom(
                    ctx,
                    "NotSupportedError",
                    "AES-GCM supports 128 or 256 bit keys",
                ));
            }
            let mut key = vec![0u8; length / 8];
            OsRng.fill_bytes(&mut key);
            KeyMaterial::Secret(Rc::new(key))
        }
        "HMAC" => {
            let mut key = vec![0u8; 64];
            OsRng.fill_bytes(&mut key);
            KeyMaterial::Secret(Rc::new(key))
        }
        "ECDSA" => KeyMaterial::EcPrivate(Rc::new(SigningKey::random(&mut OsRng))),
        _ => {
            return Err(throw_dom(
                ctx,
                "NotSupportedError",
                &format!("generateKey does not support {name}"),
            ))
        }
    };
    let key = CryptoKey {
        algorithm_name: upper,
        hash,
        extractable,
        usages,
        material,
    };
    Ok(Class::instance(ctx.clone(), key)?.into_value())
}

fn subtle_export_key<'js>(ctx: &Ctx<'js>, format: &str, key: &CryptoKey) -> Result<Value<'js>> {
    if !key.extractable {
        return Err(throw_dom(ctx, "InvalidAccessError", "key is not extractable"));
    }
    match (format, &key.material) {
        ("raw", KeyMaterial::Secret(bytes)) => {
            Ok(bytes_to_array_buffer(ctx, bytes)?.into_value())
        }
        ("raw", KeyMaterial::EcPublic(vk)) => {
            let point = vk.to_encoded_point(false);
            Ok(bytes_to_array_buffer(ctx, point.as_bytes())?.into_value())
        }
        _ => Err(throw_dom(
            ctx,
            "NotSupportedError",
            &format!("unsupported key export format {format:?}"),
        )),
    }
}

fn subtle_sign<'js>(
    ctx: &Ctx<'js>,
    _algo: &Value<'js>,
    key: &CryptoKey,
    data: &[u8],
) -> Result<Value<'js>> {
    match (&key.material, key.algorithm_name.as_str()) {
        (KeyMaterial::Secret(secret), "HMAC") => {
            let hash = key.hash.unwrap_or(Hash::Sha256);
            Ok(bytes_to_array_buffer(ctx, &hash.hmac(secret, data))?.into_value())
        }
        (KeyMaterial::EcPrivate(sk), "ECDSA") => {
            let signature: Signature = sk.sign(data);
            Ok(bytes_to_array_buffer(ctx, &signature.to_bytes())?.into_value())
        }
        _ => Err(throw_dom(
            ctx,
            "InvalidAccessError",
            "key does not support sign",
        )),
    }
}

fn subtle_verify<'js>(
    ctx: &Ctx<'js>,
    key: &CryptoKey,
    signature: &[u8],
    data: &[u8],
) -> Result<Value<'js>> {
    let ok = match (&key.material, key.algorithm_name.as_str()) {
        (KeyMaterial::Secret(secret), "HMAC") => {
            let hash = key.hash.unwrap_or(Hash::Sha256);
            hash.hmac(secret, data) == signature
        }
        (KeyMaterial::EcPublic(vk), "ECDSA") => Signature::from_slice(signature)
            .map(|sig| vk.verify(data, &sig).is_ok())
            .unwrap_or(false),
        (KeyMaterial::EcPrivate(sk), "ECDSA") => Signature::from_slice(signature)
            .map(|sig| sk.verifying_key().verify(data, &sig).is_ok())
            .unwrap_or(false),
        _ => {
            return Err(throw_dom(
                ctx,
                "InvalidAccessError",
                "key does not support verify",
            ))
        }
    };
    Ok(rquickjs::IntoJs::into_js(ok, ctx)?)
}

fn aes_params<'js>(ctx: &Ctx<'js>, algo: &Value<'js>) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let obj = algo
        .as_object()
        .ok_or_else(|| Exception::throw_type(ctx, "AES-GCM parameters are required"))?;
    let iv: Value = obj
        .get("iv")
        .map_err(|_| Exception::throw_type(ctx, "AES-GCM requires an iv"))?;
    let iv = as_bytes(&iv)?;
    if iv.len() != 12 {
        return Err(throw_dom(
            ctx,
            "NotSupportedError",
            "AES-GCM iv must be 96 bits",
        ));
    }
    let aad = match obj.get::<_, Value>("additionalData") {
        Ok(v) if !v.is_undefined() && !v.is_null() => Some(as_bytes(&v)?),
        _ => None,
    };
    Ok((iv, aad))
}

fn aes_run(
    key: &[u8],
    iv: &[u8],
    aad: Option<&[u8]>,
    data: &[u8],
    encrypt: bool,
) -> std::result::Result<Vec<u8>, String> {
    let payload = Payload {
        msg: data,
        aad: aad.unwrap_or(&[]),
    };
    let nonce = Nonce::from_slice(iv);
    match key.len() {
        16 => {
            let cipher = Aes128Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
            if encrypt {
                cipher.encrypt(nonce, payload).map_err(|e| e.to_string())
            } else {
                cipher.decrypt(nonce, payload).map_err(|e| e.to_string())
            }
        }
        32 => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
            if encrypt {
                cipher.encrypt(nonce, payload).map_err(|e| e.to_string())
            } else {
                cipher.decrypt(nonce, payload).map_err(|e| e.to_string())
            }
        }
        _ => Err("AES-GCM keys must be 128 or 256 bits".to_string()),
    }
}

fn subtle_crypt<'js>(
    ctx: &Ctx<'js>,
    algo: &Value<'js>,
    key: &CryptoKey,
    data: &[u8],
    encrypt: bool,
) -> Result<Value<'js>> {
    let (name, _) = parse_algorithm(ctx, algo)?;
    match (name.to_ascii_uppercase().as_str(), &key.material) {
        ("AES-GCM", KeyMaterial::Secret(secret)) => {
            let (iv, aad) = aes_params(ctx, algo)?;
            let out = aes_run(secret, &iv, aad.as_deref(), data, encrypt)
                .map_err(|e| throw_dom(ctx, "OperationError", &e))?;
            Ok(bytes_to_array_buffer(ctx, &out)?.into_value())
        }
        ("RSA-OAEP", KeyMaterial::RsaPublic(pk)) if encrypt => {
            let padding = Oaep::new::<Sha256>();
            let out = pk
                .encrypt(&mut OsRng, padding, data)
                .map_err(|e| throw_dom(ctx, "OperationError", &e.to_string()))?;
            Ok(bytes_to_array_buffer(ctx, &out)?.into_value())
        }
        ("RSA-OAEP", KeyMaterial::RsaPrivate(sk)) if !encrypt => {
            let padding = Oaep::new::<Sha256>();
            let out = sk
                .decrypt(padding, data)
                .map_err(|e| throw_dom(ctx, "OperationError", &e.to_string()))?;
            Ok(bytes_to_array_buffer(ctx, &out)?.into_value())
        }
        _ => Err(throw_dom(
            ctx,
            "InvalidAccessError",
            "key does not support this operation",
        )),
    }
}

pub fn setup(ctx: &Ctx<'_>) -> Result<()> {
    let globals = ctx.globals();
    Class::<CryptoKey>::define(&globals)?;

    let crypto = Object::new(ctx.clone())?;

    crypto.set(
        "getRandomValues",
        native_fn(ctx, |ctx, args| {
            let view = arg(&ctx, &args, 0);
            let obj = view
                .as_object()
                .ok_or_else(|| Exception::throw_type(&ctx, "expected a typed array"))?;
            let length: usize = obj.get("byteLength").unwrap_or(0);
            if length > 65536 {
                return Err(throw_dom(
                    &ctx,
                    "QuotaExceededError",
                    "getRandomValues is limited to 65536 bytes",
                ));
            }
            let buffer: rquickjs::ArrayBuffer = obj.get("buffer")?;
            let offset: usize = obj.get("byteOffset").unwrap_or(0);
            let mut noise = vec![0u8; length];
            OsRng.fill_bytes(&mut noise);
            if let Some(raw) = buffer.as_raw() {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        noise.as_ptr(),
                        raw.ptr.as_ptr().add(offset),
                        length,
                    );
                }
            }
            Ok(view)
        })?
        .with_name("getRandomValues")?,
    )?;

    crypto.set(
        "randomUUID",
        native_fn(ctx, |ctx, _args| {
            let id = uuid::Uuid::new_v4().to_string();
            Ok(rquickjs::String::from_str(ctx, &id)?.into_value())
        })?
        .with_name("randomUUID")?,
    )?;

    let subtle = Object::new(ctx.clone())?;

    subtle.set(
        "digest",
        native_fn(ctx, |ctx, args| {
            let result = subtle_digest(&ctx, &arg(&ctx, &args, 0), &arg(&ctx, &args, 1));
            settle(&ctx, result)
        })?
        .with_name("digest")?,
    )?;

    subtle.set(
        "importKey",
        native_fn(ctx, |ctx, args| {
            let format: String = match FromJs::from_js(&ctx, arg(&ctx, &args, 0)) {
                Ok(f) => f,
                Err(e) => return settle(&ctx, Err(e)),
            };
            let usages: Vec<String> =
                FromJs::from_js(&ctx, arg(&ctx, &args, 4)).unwrap_or_default();
            let extractable = arg(&ctx, &args, 3).as_bool().unwrap_or(false);
            let result = subtle_import_key(
                &ctx,
                &format,
                &arg(&ctx, &args, 1),
                &arg(&ctx, &args, 2),
                extractable,
                usages,
            );
            settle(&ctx, result)
        })?
        .with_name("importKey")?,
    )?;

    subtle.set(
        "exportKey",
        native_fn(ctx, |ctx, args| {
            let format: String = match FromJs::from_js(&ctx, arg(&ctx, &args, 0)) {
                Ok(f) => f,
                Err(e) => return settle(&ctx, Err(e)),
            };
            let result = get_key(&ctx, &arg(&ctx, &args, 1))
                .and_then(|key| subtle_export_key(&ctx, &format, &key));
            settle(&ctx, result)
        })?
        .with_name("exportKey")?,
    )?;

    subtle.set(
        "generateKey",
        native_fn(ctx, |ctx, args| {
            let usages: Vec<String> =
                FromJs::from_js(&ctx, arg(&ctx, &args, 2)).unwrap_or_default();
            let extractable = arg(&ctx, &args, 1).as_bool().unwrap_or(false);
            let result = subtle_generate_key(&ctx, &arg(&ctx, &args, 0), extractable, usages);
            settle(&ctx, result)
        })?
        .with_name("generateKey")?,
    )?;

    subtle.set(
        "sign",
        native_fn(ctx, |ctx, args| {
            let result = (|| {
                let key = get_key(&ctx, &arg(&ctx, &args, 1))?;
                let data = as_bytes(&arg(&ctx, &args, 2))?;
                subtle_sign(&ctx, &arg(&ctx, &args, 0), &key, &data)
            })();
            settle(&ctx, result)
        })?
        .with_name("sign")?,
    )?;

    subtle.set(
        "verify",
        native_fn(ctx, |ctx, args| {
            let result = (|| {
                let key = get_key(&ctx, &arg(&ctx, &args, 1))?;
                let signature = as_bytes(&arg(&ctx, &args, 2))?;
                let data = as_bytes(&arg(&ctx, &args, 3))?;
                subtle_verify(&ctx, &key, &signature, &data)
            })();
            settle(&ctx, result)
        })?
        .with_name("verify")?,
    )?;

    subtle.set(
        "encrypt",
        native_fn(ctx, |ctx, args| {
            let result = (|| {
                let key = get_key(&ctx, &arg(&ctx, &args, 1))?;
                let data = as_bytes(&arg(&ctx, &args, 2))?;
                subtle_crypt(&ctx, &arg(&ctx, &args, 0), &key, &data, true)
            })();
            settle(&ctx, result)
        })?
        .with_name("encrypt")?,
    )?;

    subtle.set(
        "decrypt",
        native_fn(ctx, |ctx, args| {
            let result = (|| {
                let key = get_key(&ctx, &arg(&ctx, &args, 1))?;
                let data = as_bytes(&arg(&ctx, &args, 2))?;
                subtle_crypt(&ctx, &arg(&ctx, &args, 0), &key, &data, false)
            })();
            settle(&ctx, result)
        })?
        .with_name("decrypt")?,
    )?;

    crypto.set("subtle", subtle)?;
    globals.set("crypto", crypto)?;
    Ok(())
}
