//! Built-in objects and functions visible to every BASIC handler

use crate::basic::ast::Type;

/// Objects bound by the host on every invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Intrinsic {
    Request,
    Response,
    Identity,
}

impl Intrinsic {
    pub(crate) fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "identity" => Some(Self::Identity),
            _ => None,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Request => "Request",
            Self::Response => "Response",
            Self::Identity => "Identity",
        }
    }
}

/// Shape of a member or free function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signature {
    Property {
        ty: Type,
        writable: bool,
    },
    Method {
        params: &'static [Type],
        required: usize,
        /// `None` for members that produce no value
        returns: Option<Type>,
    },
}

const fn get(ty: Type) -> Signature {
    Signature::Property { ty, writable: false }
}

const fn get_set(ty: Type) -> Signature {
    Signature::Property { ty, writable: true }
}

const fn method(params: &'static [Type], returns: Option<Type>) -> Signature {
    Signature::Method {
        params,
        required: params.len(),
        returns,
    }
}

const fn method_opt(params: &'static [Type], required: usize, returns: Option<Type>) -> Signature {
    Signature::Method {
        params,
        required,
        returns,
    }
}

use crate::basic::ast::Type::{Boolean, Double, Integer, Object, String as Str};

/// Members of the host objects
pub(crate) fn intrinsic_member(object: Intrinsic, member: &str) -> Option<Signature> {
    let member = member.to_ascii_lowercase();
    let signature = match (object, member.as_str()) {
        (Intrinsic::Request, "method" | "path" | "uri" | "body") => get(Str),
        (Intrinsic::Request, "remoteaddress") => get(Str),
        (Intrinsic::Request, "json") => get(Object),
        (Intrinsic::Request, "query" | "header" | "cookie" | "param" | "form") => {
            method(&[Str], Some(Str))
        }

        (Intrinsic::Response, "status") => get_set(Integer),
        (Intrinsic::Response, "contenttype" | "body") => get_set(Str),
        (Intrinsic::Response, "write") => method(&[Object], None),
        (Intrinsic::Response, "setheader" | "appendheader" | "setcookie") => {
            method(&[Str, Str], None)
        }
        (Intrinsic::Response, "redirect" | "redirectpermanent" | "file") => method(&[Str], None),
        (Intrinsic::Response, "json") => method(&[Object], None),

        (Intrinsic::Identity, "name" | "scheme") => get(Str),
        (Intrinsic::Identity, "isauthenticated") => get(Boolean),
        (Intrinsic::Identity, "hasclaim") => method_opt(&[Str, Str], 1, Some(Boolean)),
        (Intrinsic::Identity, "claim") => method(&[Str], Some(Str)),
        _ => return None,
    };
    Some(signature)
}

/// Members available on `String` values
pub(crate) fn string_member(member: &str) -> Option<Signature> {
    let signature = match member.to_ascii_lowercase().as_str() {
        "length" => get(Integer),
        "toupper" | "tolower" | "trim" => method(&[], Some(Str)),
        "contains" | "startswith" | "endswith" => method(&[Str], Some(Boolean)),
        "substring" => method_opt(&[Integer, Integer], 1, Some(Str)),
        "indexof" => method(&[Str], Some(Integer)),
        "replace" => method(&[Str, Str], Some(Str)),
        _ => return None,
    };
    Some(signature)
}

/// Free functions
pub(crate) fn function(name: &str) -> Option<Signature> {
    let signature = match name.to_ascii_lowercase().as_str() {
        "len" => method(&[Str], Some(Integer)),
        "ucase" | "lcase" | "trim" => method(&[Str], Some(Str)),
        "left" | "right" => method(&[Str, Integer], Some(Str)),
        "mid" => method_opt(&[Str, Integer, Integer], 2, Some(Str)),
        "instr" => method(&[Str, Str], Some(Integer)),
        "replace" => method(&[Str, Str, Str], Some(Str)),
        "cstr" => method(&[Object], Some(Str)),
        "cint" | "clng" => method(&[Object], Some(Integer)),
        "cdbl" => method(&[Object], Some(Double)),
        "cbool" => method(&[Object], Some(Boolean)),
        "isnothing" => method(&[Object], Some(Boolean)),
        "parsejson" => method(&[Str], Some(Object)),
        "tojson" => method(&[Object], Some(Str)),
        "addclaim" => method(&[Str, Object], None),
        "logdebug" | "loginfo" | "logwarn" => method(&[Str], None),
        "now" => method(&[], Some(Integer)),
        "newguid" => method(&[], Some(Str)),
        _ => return None,
    };
    Some(signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(Intrinsic::lookup("RESPONSE"), Some(Intrinsic::Response));
        assert_eq!(
            intrinsic_member(Intrinsic::Response, "status"),
            Some(Signature::Property {
                ty: Type::Integer,
                writable: true
            })
        );
        assert!(intrinsic_member(Intrinsic::Request, "Status").is_none());
        assert!(function("UCase").is_some());
        assert!(function("Print").is_none());
    }
}
