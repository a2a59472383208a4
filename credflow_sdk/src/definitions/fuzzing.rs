use super::*;
use arbitrary::Unstructured;

/// Issuance parameters with an arbitrary mix of populated fields
#[derive(Debug)]
pub struct Wrapper(pub IssuanceFlowParams);

impl<'a> arbitrary::Arbitrary<'a> for Wrapper {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        // any JSON will do for the opaque fields, their content is never inspected
        let opaque = |u: &mut Unstructured<'a>| -> arbitrary::Result<Option<Value>> {
            Ok(u.arbitrary::<Option<String>>()?.map(Value::String))
        };

        Ok(Wrapper(IssuanceFlowParams {
            flow_id: u.arbitrary()?,
            credential_offer_uri: u.arbitrary()?,
            credential_offer: opaque(u)?,
            holder_binding: opaque(u)?,
            credential_configuration_id: u.arbitrary()?,
            authorization_code: u.arbitrary()?,
            code_verifier: u.arbitrary()?,
            redirect_uri: u.arbitrary()?,
            pre_authorized_code: u.arbitrary()?,
            tx_code: u.arbitrary()?,
        }))
    }
}
